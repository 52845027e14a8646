//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use rootbot_lib::Robot;
#[allow(unused_imports)]
pub use rootbot_lib::config::RobotConfig;
#[allow(unused_imports)]
pub use rootbot_lib::error::RobotError;
#[allow(unused_imports)]
pub use rootbot_lib::packet::{EventKey, PACKET_LEN, Packet};
#[allow(unused_imports)]
pub use rootbot_lib::transport::{ChannelTransport, Frame};
#[allow(unused_imports)]
pub use std::time::Duration;
#[allow(unused_imports)]
pub use tokio::sync::mpsc::UnboundedReceiver;

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Vec<u8> {
    hex::decode(hex_data).expect("Failed to decode hex")
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A started robot wired to a channel that yields every frame it sends.
#[allow(dead_code)]
pub fn running_robot() -> (Robot, UnboundedReceiver<Frame>) {
    running_robot_with(RobotConfig::default().with_reply_timeout(Some(Duration::from_secs(5))))
}

#[allow(dead_code)]
pub fn running_robot_with(config: RobotConfig) -> (Robot, UnboundedReceiver<Frame>) {
    init_tracing();
    let (transport, frames) = ChannelTransport::new();
    let robot = Robot::with_config(transport, config);
    robot.run();
    (robot, frames)
}

/// Build the robot's reply to `request`, echoing its device, command and sequence.
#[allow(dead_code)]
pub fn reply_to(request: &Frame, payload: &[u8]) -> Frame {
    Packet::new(request[0], request[1], request[2], payload)
        .expect("Reply payload too long")
        .to_bytes()
}

/// Build an event frame with a zero timestamp followed by `data`.
#[allow(dead_code)]
pub fn event_frame(key: EventKey, data: &[u8]) -> Frame {
    let mut payload = vec![0u8; 4];
    payload.extend_from_slice(data);
    Packet::new(key.device, key.command, 0, &payload)
        .expect("Event payload too long")
        .to_bytes()
}

/// Wait up to a second for `condition` to hold.
#[allow(dead_code)]
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Condition not reached in time");
}
