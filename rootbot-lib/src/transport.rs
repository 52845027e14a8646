//! The seam between the protocol engine and the Bluetooth link.
//!
//! Outbound frames go through [`Transport::send`]. Inbound data is pushed by
//! the adapter into [`Robot::data_received`](crate::Robot::data_received),
//! and a dropped link is reported with
//! [`Robot::disconnected`](crate::Robot::disconnected).

use crate::error::{Result, RobotError};
use crate::packet::PACKET_LEN;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Service advertised by the robot, used to filter the device scan.
pub const ID_SERVICE: &str = "48c5d828-ac2a-442d-97a3-0c9822b04979";
/// Nordic UART service carrying the packet stream.
pub const UART_SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
/// Characteristic written by the host.
pub const TX_CHARACTERISTIC: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
/// Characteristic notified by the robot.
pub const RX_CHARACTERISTIC: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

pub type Frame = [u8; PACKET_LEN];

#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one frame, returning once the link has accepted it.
    async fn send(&self, frame: &Frame) -> Result<()>;
}

/// Transport that hands every outgoing frame to a channel.
///
/// Useful for simulators and tests that play the robot's side.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Frame>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: &Frame) -> Result<()> {
        self.tx
            .send(*frame)
            .map_err(|_| RobotError::Transport("link closed".to_string()))
    }
}
