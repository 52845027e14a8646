//! Event subscriptions, filters and the built-in stop/stall/cliff handlers

mod common;

use common::*;
use rootbot_lib::robot::events;
use rootbot_lib::types::{Bumper, Color, ColorCode, Light, LightState, Touch};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};

#[tokio::test]
async fn test_bump_filters() {
    let (robot, _frames) = running_robot();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for (name, filter) in [
        ("any", None),
        ("both", Some(Bumper::new(true, true))),
        ("left", Some(Bumper::new(true, false))),
    ] {
        let tx = tx.clone();
        robot.on_bump(filter, move |_robot, bumper| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((name, bumper));
            }
        });
    }

    robot.data_received(&event_frame(events::BUMP, &[0x80]));
    let mut fired = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
    fired.sort_by_key(|(name, _)| *name);
    assert_eq!(
        fired,
        vec![("any", Bumper::new(true, false)), ("left", Bumper::new(true, false))]
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err(), "'both' must not fire for a left bump");
}

#[tokio::test]
async fn test_color_filter_zones() {
    let (robot, _frames) = running_robot();
    let (tx, mut rx) = mpsc::unbounded_channel();
    robot.on_color(
        Some(Color::new([ColorCode::Any, ColorCode::Black, ColorCode::Any])),
        move |_robot, color| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(color);
            }
        },
    );

    // Color readings carry no timestamp: the zones start at the first payload byte.
    let reading = |payload: &[u8]| {
        Packet::new(events::COLOR.device, events::COLOR.command, 0, payload)
            .unwrap()
            .to_bytes()
    };
    // Black only at the far left: no match.
    robot.data_received(&reading(&[0x1F]));
    // Black in the middle third.
    let mut payload = [0u8; 16];
    payload[7] = 0x10;
    robot.data_received(&reading(&payload));

    let color = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(color.zones[14], ColorCode::Black);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_light_filter_compares_state_only() {
    let (robot, _frames) = running_robot();
    let (tx, mut rx) = mpsc::unbounded_channel();
    robot.on_light(Some(Light::new(LightState::LeftBrighter)), move |_robot, light| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(light);
        }
    });

    robot.data_received(&event_frame(events::LIGHT, &[5, 0, 10, 0, 20]));
    robot.data_received(&event_frame(events::LIGHT, &[6, 0x01, 0xF4, 0x00, 0x64]));

    let light = rx.recv().await.unwrap();
    assert_eq!(light.state, LightState::LeftBrighter);
    assert_eq!((light.left, light.right), (500, 100));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_touch_filter_requires_exact_state() {
    let (robot, _frames) = running_robot();
    let (tx, mut rx) = mpsc::unbounded_channel();
    robot.on_touch(Some(Touch::new(true, false, false, false)), move |_robot, touch| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(touch);
        }
    });

    robot.data_received(&event_frame(events::TOUCH, &[0xC0]));
    robot.data_received(&event_frame(events::TOUCH, &[0x80]));

    assert_eq!(rx.recv().await.unwrap(), Touch::new(true, false, false, false));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_new_event_cancels_running_handler() {
    let (robot, _frames) = running_robot();
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    robot.on_bump(None, {
        let finished = finished.clone();
        let release = release.clone();
        move |_robot, bumper| {
            let started_tx = started_tx.clone();
            let finished = finished.clone();
            let release = release.clone();
            async move {
                let _ = started_tx.send(bumper);
                release.notified().await;
                finished.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    robot.data_received(&event_frame(events::BUMP, &[0x80]));
    assert_eq!(started.recv().await, Some(Bumper::new(true, false)));

    robot.data_received(&event_frame(events::BUMP, &[0x40]));
    assert_eq!(started.recv().await, Some(Bumper::new(false, true)));
    tokio::time::sleep(Duration::from_millis(20)).await;

    release.notify_waiters();
    eventually(|| finished.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1, "the superseded handler must not finish");
}

#[tokio::test]
async fn test_stall_disables_motor_commands() {
    let (robot, mut frames) = running_robot();
    assert!(robot.motors_enabled());

    robot.data_received(&event_frame(events::STALL, &[]));
    eventually(|| !robot.motors_enabled()).await;

    robot.set_speeds(5.0, 5.0).await.unwrap();
    robot.drive_distance(10.0).await.unwrap();
    robot.set_marker(1).await.unwrap();
    assert!(frames.try_recv().is_err(), "motor commands must be no-ops");

    // Non-motor commands still go out.
    robot.reset_position().await.unwrap();
    assert_eq!(&frames.recv().await.unwrap()[..2], &[1, 15]);

    robot.run();
    assert!(robot.motors_enabled());
}

#[tokio::test]
async fn test_cliff_filter_matches_tripped_state_only() {
    let (robot, _frames) = running_robot();

    robot.data_received(&event_frame(events::CLIFF, &[1]));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(robot.motors_enabled());

    robot.data_received(&event_frame(events::CLIFF, &[0]));
    eventually(|| !robot.motors_enabled()).await;

    robot.data_received(&event_frame(events::CLIFF, &[1]));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!robot.motors_enabled());
}

#[tokio::test]
async fn test_stop_notification_stops_robot() {
    let (robot, mut frames) = running_robot();

    robot.data_received(&event_frame(events::STOP, &[]));
    eventually(|| !robot.is_running()).await;

    let stop = frames.recv().await.unwrap();
    assert_eq!(&stop[..2], &[0, 3]);
}

#[tokio::test]
async fn test_events_ignored_while_idle() {
    let (robot, _frames) = running_robot();
    let count = Arc::new(AtomicUsize::new(0));
    robot.on_bump(None, {
        let count = count.clone();
        move |_robot, _bumper| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    robot.disconnected();
    robot.data_received(&event_frame(events::BUMP, &[0x80]));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    // Starting again clears earlier subscriptions.
    robot.run();
    robot.data_received(&event_frame(events::BUMP, &[0x80]));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handler_can_command_robot() {
    let (robot, mut frames) = running_robot();
    robot.on_touch(None, |robot, _touch| async move {
        let _ = robot.set_lights(0, 255, 0, 1).await;
    });

    robot.data_received(&event_frame(events::TOUCH, &[0x10]));
    let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&frame[..2], &[3, 2]);
    assert_eq!(&frame[3..7], &[1, 0, 255, 0]);
}

/// Subscribe a bump handler that signals when it starts and counts the
/// handlers that ran to completion.
fn slow_bump_handler(robot: &Robot) -> (mpsc::UnboundedReceiver<()>, Arc<AtomicUsize>) {
    let (started_tx, started) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicUsize::new(0));
    robot.on_bump(None, {
        let finished = finished.clone();
        move |_robot, _bumper| {
            let started_tx = started_tx.clone();
            let finished = finished.clone();
            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    (started, finished)
}

#[tokio::test]
async fn test_stop_aborts_running_handlers() {
    let (robot, mut frames) = running_robot();
    let (mut started, finished) = slow_bump_handler(&robot);

    robot.data_received(&event_frame(events::BUMP, &[0x80]));
    started.recv().await.unwrap();

    robot.stop().await.unwrap();
    assert_eq!(&frames.recv().await.unwrap()[..2], &[0, 3]);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_disconnect_aborts_running_handlers() {
    let (robot, _frames) = running_robot();
    let (mut started, finished) = slow_bump_handler(&robot);

    robot.data_received(&event_frame(events::BUMP, &[0x40]));
    started.recv().await.unwrap();

    robot.disconnected();
    assert!(!robot.is_running());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handler_runs_to_completion_without_interruption() {
    let (robot, _frames) = running_robot();
    let (mut started, finished) = slow_bump_handler(&robot);

    robot.data_received(&event_frame(events::BUMP, &[0x80]));
    started.recv().await.unwrap();
    eventually(|| finished.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_frames_leave_one_running_unit() {
    let (robot, _frames) = running_robot();
    let finished = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());
    robot.on_bump(None, {
        let finished = finished.clone();
        let release = release.clone();
        move |_robot, _bumper| {
            let finished = finished.clone();
            let release = release.clone();
            async move {
                release.notified().await;
                finished.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let callers: Vec<_> = (0..8)
        .map(|i| {
            let robot = robot.clone();
            let data = if i % 2 == 0 { 0x80 } else { 0x40 };
            tokio::task::spawn_blocking(move || robot.data_received(&event_frame(events::BUMP, &[data])))
        })
        .collect();
    for caller in callers {
        caller.await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    release.notify_waiters();
    eventually(|| finished.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}
