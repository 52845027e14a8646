//! An in-process stand-in for the robot, answering frames the way the
//! firmware does.

use bytes::{Buf, BufMut, BytesMut};
use rootbot_lib::Robot;
use rootbot_lib::config::RobotConfig;
use rootbot_lib::packet::{EventKey, Packet};
use rootbot_lib::robot::events;
use rootbot_lib::transport::{ChannelTransport, Frame};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

/// Simulated motion runs this many times faster than the real robot.
const SPEEDUP: f64 = 20.0;
/// cm/s while driving.
const DRIVE_SPEED: f64 = 10.0;
/// degrees/s while turning.
const TURN_SPEED: f64 = 90.0;

#[derive(Debug)]
pub struct SimulatedRobot {
    started: Instant,
    name: String,
    x: f64,
    y: f64,
    heading: f64,
    battery_mv: u16,
    bump_after_drive: bool,
}

impl SimulatedRobot {
    pub fn new(name: &str) -> Self {
        Self {
            started: Instant::now(),
            name: name.to_string(),
            x: 0.0,
            y: 0.0,
            heading: 90.0,
            battery_mv: 3950,
            bump_after_drive: false,
        }
    }

    /// Report a left bumper hit after every completed `drive_distance`.
    pub fn with_bump_after_drive(mut self) -> Self {
        self.bump_after_drive = true;
        self
    }

    /// Create a robot wired to this simulator and start answering its frames.
    pub fn attach(self, robot_config: RobotConfig) -> (Robot, JoinHandle<()>) {
        let (transport, frames) = ChannelTransport::new();
        let robot = Robot::with_config(transport, robot_config);
        let task = tokio::spawn(self.serve(robot.clone(), frames));
        (robot, task)
    }

    async fn serve(mut self, robot: Robot, mut frames: UnboundedReceiver<Frame>) {
        while let Some(frame) = frames.recv().await {
            let request = match Packet::from_bytes(&frame).and_then(Packet::verify) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Simulator got a bad frame: {}", e);
                    continue;
                }
            };
            trace!("SIM <- {}", request);

            let delay = self.apply(&request);
            let payload = match self.reply_payload(&request) {
                Some(payload) => payload,
                None => continue,
            };
            if !delay.is_zero() {
                sleep(delay).await;
            }
            self.deliver(&robot, &request, &payload);

            if self.bump_after_drive && (request.device, request.command) == (1, 8) {
                let data = self.stamped(&[0x80]);
                self.notify(&robot, events::BUMP, &data);
            }
        }
        debug!("Simulator link closed");
    }

    /// Update the simulated state and return how long the command takes.
    fn apply(&mut self, request: &Packet) -> Duration {
        let payload = &request.payload;
        let seconds = match (request.device, request.command) {
            (0, 1) => {
                self.name = String::from_utf8_lossy(payload).trim_end_matches('\0').to_string();
                0.0
            }
            (1, 8) => {
                let distance = f64::from((&payload[..]).get_i32()) / 10.0;
                let radians = self.heading.to_radians();
                self.x += distance * radians.cos();
                self.y += distance * radians.sin();
                distance.abs() / DRIVE_SPEED
            }
            (1, 12) => {
                let angle = f64::from((&payload[..]).get_i32()) / 10.0;
                self.heading = (self.heading - angle).rem_euclid(360.0);
                angle.abs() / TURN_SPEED
            }
            (1, 15) => {
                self.x = 0.0;
                self.y = 0.0;
                self.heading = 90.0;
                0.0
            }
            (1, 27) => {
                let mut data = &payload[..];
                let angle = f64::from(data.get_i32()) / 10.0;
                let radius = f64::from(data.get_i32()) / 10.0;
                self.heading = (self.heading + angle).rem_euclid(360.0);
                (angle.to_radians() * radius).abs() / DRIVE_SPEED
            }
            (5, 0) => f64::from((&payload[4..]).get_u16()) / 1000.0,
            (5, 4) => 0.05 * payload.iter().take_while(|b| **b != 0).count() as f64,
            (5, 5) => f64::from((&payload[8..]).get_u16()) / 1000.0,
            _ => 0.0,
        };
        self.battery_mv = self.battery_mv.saturating_sub(1);
        Duration::from_secs_f64(seconds / SPEEDUP)
    }

    fn reply_payload(&self, request: &Packet) -> Option<Vec<u8>> {
        let payload = match (request.device, request.command) {
            (0, 0) => vec![request.payload[0], 1, 4, 1, 0, 1, 0, 1, 4],
            (0, 2) => self.name.as_bytes().to_vec(),
            (1, 8) | (1, 12) | (1, 27) | (2, 0) | (5, 0) | (5, 4) | (5, 5) => self.stamped(&[]),
            (1, 16) => {
                let mut data = BytesMut::with_capacity(6);
                for value in [self.x, self.y, self.heading] {
                    data.put_i16((value * 10.0).round() as i16);
                }
                self.stamped(&data)
            }
            (4, 1) => {
                let bank = u16::from(request.payload[0]);
                let mut data = BytesMut::with_capacity(16);
                for i in 0..8u16 {
                    data.put_u16(1000 + bank * 100 + i);
                }
                data.to_vec()
            }
            (13, 1) => self.stamped(&[0x01, 0x90, 0x01, 0xA4]),
            (14, 1) => {
                let percent = ((self.battery_mv.saturating_sub(3000)) / 12).min(100) as u8;
                let mut data = BytesMut::with_capacity(3);
                data.put_u16(self.battery_mv);
                data.put_u8(percent);
                self.stamped(&data)
            }
            (16, 1) => self.stamped(&[0x00, 0x00, 0x00, 0x00, 0x03, 0xE8]),
            _ => return None,
        };
        Some(payload)
    }

    fn stamped(&self, data: &[u8]) -> Vec<u8> {
        let millis = u32::try_from(self.started.elapsed().as_millis()).unwrap_or(u32::MAX);
        let mut payload = BytesMut::with_capacity(4 + data.len());
        payload.put_u32(millis);
        payload.put_slice(data);
        payload.to_vec()
    }

    fn deliver(&self, robot: &Robot, request: &Packet, payload: &[u8]) {
        match Packet::new(request.device, request.command, request.sequence, payload) {
            Ok(reply) => {
                trace!("SIM -> {}", reply);
                robot.data_received(&reply.to_bytes());
            }
            Err(e) => warn!("Simulator could not build reply: {}", e),
        }
    }

    fn notify(&self, robot: &Robot, key: EventKey, payload: &[u8]) {
        if let Ok(event) = Packet::new(key.device, key.command, 0, payload) {
            debug!("SIM event {}", key);
            robot.data_received(&event.to_bytes());
        }
    }
}
