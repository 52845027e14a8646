//! The robot facade and protocol engine.
//!
//! A [`Robot`] owns the sequence counter, the table of requests waiting for a
//! reply, the event subscriptions and the handler tasks started by them.
//! Commands are plain `async` methods. Inbound frames enter through
//! [`Robot::data_received`], which resolves waiting requests and starts the
//! matching event handlers.
//!
//! Subscriptions are cleared by [`Robot::run`], so register handlers after
//! starting the robot:
//!
//! ```no_run
//! # async fn example(robot: rootbot_lib::Robot) -> rootbot_lib::error::Result<()> {
//! use rootbot_lib::types::Bumper;
//!
//! robot.run();
//! robot.on_bump(Some(Bumper::new(true, false)), |robot, _bumper| async move {
//!     let _ = robot.turn_right(90.0).await;
//! });
//! robot.drive_distance(20.0).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RobotConfig;
use crate::error::{Result, RobotError};
use crate::packet::{CorrelationKey, EventKey, PAYLOAD_LEN, Packet};
use crate::transport::Transport;
use crate::types::{Bumper, Color, Light, Touch, note_with_reference};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Event keys of the notifications the robot sends on its own.
pub mod events {
    use crate::packet::EventKey;

    pub const STOP: EventKey = EventKey::new(0, 4);
    pub const STALL: EventKey = EventKey::new(1, 29);
    pub const COLOR: EventKey = EventKey::new(4, 2);
    pub const BUMP: EventKey = EventKey::new(12, 0);
    pub const LIGHT: EventKey = EventKey::new(13, 0);
    pub const TOUCH: EventKey = EventKey::new(17, 0);
    pub const CLIFF: EventKey = EventKey::new(20, 0);
}

/// Wrapping 8-bit request counter.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    next: u8,
}

impl SequenceCounter {
    /// Return the current value and advance, wrapping from 255 to 0.
    pub fn next_value(&mut self) -> u8 {
        let value = self.next;
        self.next = self.next.wrapping_add(1);
        value
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Parameters of [`Robot::play_sweep`].
#[derive(Debug, Clone, PartialEq)]
pub struct Sweep {
    /// Hertz.
    pub start_frequency: f64,
    /// Hertz.
    pub end_frequency: f64,
    /// Seconds.
    pub duration: f64,
    /// Envelope attack in seconds.
    pub attack: f64,
    /// Envelope release in seconds.
    pub release: f64,
    /// 0.0 to 1.0.
    pub volume: f64,
    /// A [`ModulationType`](crate::types::ModulationType) code.
    pub modulation_type: i32,
    /// Hertz.
    pub modulation_rate: i32,
    /// Play after the current sweep instead of replacing it.
    pub append: bool,
}

impl Default for Sweep {
    fn default() -> Self {
        Self {
            start_frequency: 0.0,
            end_frequency: 0.0,
            duration: 0.0,
            attack: 0.0,
            release: 0.0,
            volume: 1.0,
            modulation_type: 0,
            modulation_rate: 0,
            append: false,
        }
    }
}

impl Sweep {
    pub fn new(start_frequency: f64, end_frequency: f64, duration: f64) -> Self {
        Self {
            start_frequency,
            end_frequency,
            duration,
            ..Self::default()
        }
    }

    pub fn with_modulation(mut self, kind: impl Into<i32>, rate: i32) -> Self {
        self.modulation_type = kind.into();
        self.modulation_rate = rate;
        self
    }

    pub(crate) fn payload(&self) -> BytesMut {
        let mut payload = BytesMut::with_capacity(PAYLOAD_LEN);
        payload.put_u32(magnitude_u32(thousandths(self.start_frequency)));
        payload.put_u32(magnitude_u32(thousandths(self.end_frequency)));
        payload.put_u16(magnitude_u16(thousandths(self.duration)));
        payload.put_u8(thousandths(self.attack).clamp(0, 255) as u8);
        payload.put_u8(thousandths(self.release).clamp(0, 255) as u8);
        payload.put_u8(((self.volume * 255.0) as i64).clamp(0, 255) as u8);
        payload.put_u8(self.modulation_type.clamp(0, 3) as u8);
        payload.put_u8(self.modulation_rate.clamp(0, 255) as u8);
        payload.put_u8(self.append.into());
        payload
    }
}

fn tenths(value: f64) -> i32 {
    (value * 10.0) as i32
}

fn thousandths(value: f64) -> i64 {
    (value * 1000.0) as i64
}

fn magnitude_u32(value: i64) -> u32 {
    value.unsigned_abs().min(u64::from(u32::MAX)) as u32
}

fn magnitude_u16(value: i64) -> u16 {
    value.unsigned_abs().min(u64::from(u16::MAX)) as u16
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A filter and its handler, erased into one call that yields the handler
/// invocation when the packet matches.
type Subscription = Arc<dyn Fn(&Robot, &Packet) -> Option<HandlerFuture> + Send + Sync>;

#[derive(Default)]
struct State {
    running: bool,
    motors_enabled: bool,
    sequence: SequenceCounter,
    responses: HashMap<CorrelationKey, oneshot::Sender<Packet>>,
    events: HashMap<EventKey, Vec<Subscription>>,
    tasks: HashMap<EventKey, AbortHandle>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: RobotConfig,
    state: Mutex<State>,
}

/// Handle to a robot reachable through a [`Transport`].
///
/// Cloning is cheap and every clone drives the same engine.
#[derive(Clone)]
pub struct Robot {
    inner: Arc<Inner>,
}

impl fmt::Debug for Robot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Robot")
            .field("running", &state.running)
            .field("motors_enabled", &state.motors_enabled)
            .field("pending", &state.responses.len())
            .finish_non_exhaustive()
    }
}

impl Robot {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_config(transport, RobotConfig::default())
    }

    pub fn with_config(transport: impl Transport + 'static, config: RobotConfig) -> Self {
        let state = State {
            motors_enabled: true,
            ..State::default()
        };
        Self {
            inner: Arc::new(Inner {
                transport: Arc::new(transport),
                config,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn config(&self) -> &RobotConfig {
        &self.inner.config
    }

    // The lock is never held across an await point.
    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Lifecycle ---

    /// Start communicating: reset the sequence counter, clear all tables and
    /// install the built-in stop, stall and cliff handlers.
    pub fn run(&self) {
        {
            let mut state = self.state();
            for (_, task) in state.tasks.drain() {
                task.abort();
            }
            state.responses.clear();
            state.events.clear();
            state.sequence.reset();
            state.motors_enabled = true;
            state.running = true;
        }

        self.subscribe(events::STOP, |packet| Some(packet.clone()), |robot, _| async move {
            if let Err(e) = robot.stop().await {
                warn!("Failed to stop after stop notification: {}", e);
            }
        });
        self.subscribe(events::STALL, |_| Some(()), |robot, _| async move {
            warn!("Motor stall reported, disabling motor commands");
            robot.enable_motors(false);
        });
        // Only the tripped state is matched; nothing re-enables the motors
        // until the next `run`.
        self.subscribe(
            events::CLIFF,
            |packet| (packet.payload[4] == 0).then_some(()),
            |robot, _| async move {
                warn!("Cliff detected, disabling motor commands");
                robot.enable_motors(false);
            },
        );
        info!("Robot running");
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Send the stop command and end communication.
    ///
    /// Requests still waiting for a reply are abandoned and running event
    /// handlers are aborted.
    pub async fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let packet = Packet::new(0, 3, self.next_sequence(), &[])?;
        let sent = self.write_packet(&packet).await;
        self.shutdown();
        info!("Robot stopped");
        sent
    }

    /// Called by the transport adapter when the link drops.
    pub fn disconnected(&self) {
        info!("Link lost");
        self.shutdown();
    }

    fn shutdown(&self) {
        let mut state = self.state();
        state.running = false;
        let abandoned = state.responses.len();
        // Dropping the senders wakes every waiter with "abandoned".
        state.responses.clear();
        for (key, task) in state.tasks.drain() {
            debug!("Aborting handlers for {}", key);
            task.abort();
        }
        if abandoned > 0 {
            debug!("Abandoned {} pending requests", abandoned);
        }
    }

    /// Block or allow motor commands.
    pub fn enable_motors(&self, enable: bool) {
        self.state().motors_enabled = enable;
    }

    pub fn motors_enabled(&self) -> bool {
        self.state().motors_enabled
    }

    // --- Raw packet I/O ---

    /// Take the next sequence value.
    pub fn next_sequence(&self) -> u8 {
        self.state().sequence.next_value()
    }

    /// Send a packet to the robot.
    pub async fn write_packet(&self, packet: &Packet) -> Result<()> {
        if !self.is_running() {
            return Err(RobotError::NotRunning);
        }
        self.inner.transport.send(&packet.to_bytes()).await?;
        trace!("TX: {}", packet);
        Ok(())
    }

    /// Send a packet and wait for the reply carrying the same device, command
    /// and sequence.
    ///
    /// Returns `Ok(None)` when the request was abandoned by [`Robot::stop`]
    /// or a disconnect, and [`RobotError::Timeout`] when no reply arrived
    /// within the configured timeout.
    pub async fn request(&self, packet: Packet) -> Result<Option<Packet>> {
        let key = packet.correlation_key();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            if !state.running {
                return Err(RobotError::NotRunning);
            }
            state.responses.insert(key, tx);
        }

        if let Err(e) = self.write_packet(&packet).await {
            self.state().responses.remove(&key);
            return Err(e);
        }

        let reply = match self.inner.config.reply_timeout() {
            Some(limit) => match timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(elapsed) => {
                    self.forget_request(key);
                    debug!("No reply for {} within {:?}", key, limit);
                    return Err(elapsed.into());
                }
            },
            None => rx.await,
        };
        Ok(reply.ok())
    }

    fn forget_request(&self, key: CorrelationKey) {
        let mut state = self.state();
        // Only drop the slot if it is still ours, i.e. nobody is listening.
        if state.responses.get(&key).is_some_and(|tx| tx.is_closed()) {
            state.responses.remove(&key);
        }
    }

    async fn send(&self, device: u8, command: u8, payload: &[u8]) -> Result<()> {
        let packet = Packet::new(device, command, self.next_sequence(), payload)?;
        self.write_packet(&packet).await
    }

    async fn query(&self, device: u8, command: u8, payload: &[u8]) -> Result<Option<Packet>> {
        let packet = Packet::new(device, command, self.next_sequence(), payload)?;
        self.request(packet).await
    }

    /// Send a command whose reply only signals completion.
    async fn acknowledged(&self, device: u8, command: u8, payload: &[u8]) -> Result<()> {
        let packet = Packet::new(device, command, self.next_sequence(), payload)?;
        let key = packet.correlation_key();
        match self.request(packet).await? {
            Some(_) => Ok(()),
            None => Err(RobotError::Abandoned(key)),
        }
    }

    fn motors_blocked(&self, command: &str) -> bool {
        let blocked = !self.motors_enabled();
        if blocked {
            debug!("Motors disabled, ignoring {}", command);
        }
        blocked
    }

    // --- Inbound ---

    /// Handle one notification from the transport.
    ///
    /// Must be called from within a tokio runtime, since matching event
    /// handlers are spawned as tasks.
    pub fn data_received(&self, data: &[u8]) {
        if !self.is_running() {
            return;
        }

        let packet = match Packet::from_bytes(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return;
            }
        };
        trace!("RX: {}", packet);

        let packet = match packet.verify() {
            Ok(packet) => packet,
            Err(e) => {
                warn!("CRC fail: {} ({})", hex::encode(data), e);
                return;
            }
        };

        let subscriptions = {
            let mut state = self.state();
            if let Some(tx) = state.responses.remove(&packet.correlation_key()) {
                if tx.send(packet.clone()).is_err() {
                    debug!("Reply {} arrived after its request gave up", packet.correlation_key());
                }
            }
            state.events.get(&packet.event_key()).cloned().unwrap_or_default()
        };

        // Filters and handler constructors run without the lock held.
        let invocations: Vec<HandlerFuture> = subscriptions
            .iter()
            .filter_map(|subscription| subscription(self, &packet))
            .collect();
        if invocations.is_empty() {
            return;
        }

        let key = packet.event_key();
        let mut state = self.state();
        if !state.running {
            return;
        }
        debug!("Dispatching {} handler(s) for {}", invocations.len(), key);
        // Spawned and recorded under one lock, so the last unit started for a
        // key is always the one left in the table.
        let task = tokio::spawn(async move {
            // Dropping the set on abort aborts every handler in it.
            let mut handlers = JoinSet::new();
            for invocation in invocations {
                handlers.spawn(invocation);
            }
            while handlers.join_next().await.is_some() {}
        });
        if let Some(previous) = state.tasks.insert(key, task.abort_handle()) {
            previous.abort();
        }
    }

    // --- Event subscriptions ---

    /// Register a handler for raw packets under `key`.
    ///
    /// `filter` decides whether the handler fires and produces its argument.
    /// When a new matching packet arrives while handlers started by the
    /// previous packet under the same key are still running, those are
    /// aborted first.
    pub fn subscribe<V, P, F, Fut>(&self, key: EventKey, filter: P, handler: F)
    where
        V: Send + 'static,
        P: Fn(&Packet) -> Option<V> + Send + Sync + 'static,
        F: Fn(Robot, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subscription: Subscription = Arc::new(move |robot: &Robot, packet: &Packet| {
            filter(packet).map(|value| Box::pin(handler(robot.clone(), value)) as HandlerFuture)
        });
        self.state().events.entry(key).or_default().push(subscription);
    }

    /// Handle color sensor events. With a filter, only readings matching it
    /// per [`Color::matches`] are passed on.
    pub fn on_color<F, Fut>(&self, filter: Option<Color>, handler: F)
    where
        F: Fn(Robot, Color) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(
            events::COLOR,
            move |packet| {
                let color = Color::from_packet(packet);
                match &filter {
                    Some(filter) if !color.matches(filter) => None,
                    _ => Some(color),
                }
            },
            handler,
        );
    }

    pub fn on_bump<F, Fut>(&self, filter: Option<Bumper>, handler: F)
    where
        F: Fn(Robot, Bumper) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(
            events::BUMP,
            move |packet| {
                let bumper = Bumper::from_packet(packet);
                filter.is_none_or(|f| f == bumper).then_some(bumper)
            },
            handler,
        );
    }

    /// Handle light events. A filter matches on the comparator state only.
    pub fn on_light<F, Fut>(&self, filter: Option<Light>, handler: F)
    where
        F: Fn(Robot, Light) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(
            events::LIGHT,
            move |packet| {
                let light = Light::from_packet(packet);
                filter.is_none_or(|f| f.state == light.state).then_some(light)
            },
            handler,
        );
    }

    pub fn on_touch<F, Fut>(&self, filter: Option<Touch>, handler: F)
    where
        F: Fn(Robot, Touch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(
            events::TOUCH,
            move |packet| {
                let touch = Touch::from_packet(packet);
                filter.is_none_or(|f| f == touch).then_some(touch)
            },
            handler,
        );
    }

    // --- General ---

    /// Version numbers: board, then major/minor pairs for firmware, hardware,
    /// bootloader and protocol. Empty if the request was abandoned.
    pub async fn get_versions(&self, board: u8) -> Result<Vec<u8>> {
        let reply = self.query(0, 0, &[board]).await?;
        Ok(reply.map(|p| p.payload[..9].to_vec()).unwrap_or_default())
    }

    /// Set the advertised name, dropping trailing characters until it fits
    /// in one payload.
    pub async fn set_name(&self, name: &str) -> Result<()> {
        let mut end = name.len();
        while end > PAYLOAD_LEN {
            end = name[..end].char_indices().next_back().map_or(0, |(i, _)| i);
        }
        self.send(0, 1, name[..end].as_bytes()).await
    }

    pub async fn get_name(&self) -> Result<String> {
        let reply = self.query(0, 2, &[]).await?;
        Ok(reply
            .map(|p| String::from_utf8_lossy(&p.payload).trim_end_matches('\0').to_string())
            .unwrap_or_default())
    }

    // --- Motors ---

    /// Set both wheel speeds in cm/s, limited to ±10 cm/s.
    pub async fn set_speeds(&self, left: f64, right: f64) -> Result<()> {
        if self.motors_blocked("set_speeds") {
            return Ok(());
        }
        let mut payload = BytesMut::with_capacity(8);
        payload.put_i32(tenths(left).clamp(-100, 100));
        payload.put_i32(tenths(right).clamp(-100, 100));
        self.send(1, 4, &payload).await
    }

    pub async fn set_left_speed(&self, speed: f64) -> Result<()> {
        if self.motors_blocked("set_left_speed") {
            return Ok(());
        }
        self.send(1, 6, &tenths(speed).clamp(-100, 100).to_be_bytes()).await
    }

    pub async fn set_right_speed(&self, speed: f64) -> Result<()> {
        if self.motors_blocked("set_right_speed") {
            return Ok(());
        }
        self.send(1, 7, &tenths(speed).clamp(-100, 100).to_be_bytes()).await
    }

    /// Drive straight for `distance` centimeters and wait until done.
    pub async fn drive_distance(&self, distance: f64) -> Result<()> {
        if self.motors_blocked("drive_distance") {
            return Ok(());
        }
        self.acknowledged(1, 8, &tenths(distance).to_be_bytes()).await
    }

    /// Rotate clockwise by `angle` degrees and wait until done.
    pub async fn turn_right(&self, angle: f64) -> Result<()> {
        if self.motors_blocked("turn") {
            return Ok(());
        }
        self.acknowledged(1, 12, &tenths(angle).to_be_bytes()).await
    }

    pub async fn turn_left(&self, angle: f64) -> Result<()> {
        self.turn_right(-angle).await
    }

    pub async fn reset_position(&self) -> Result<()> {
        self.send(1, 15, &[]).await
    }

    /// Position estimate as (x cm, y cm, heading degrees).
    pub async fn get_position(&self) -> Result<(f64, f64, f64)> {
        let reply = self.query(1, 16, &[]).await?;
        Ok(reply.map_or((0.0, 0.0, 0.0), |p| {
            let mut data = &p.payload[4..10];
            (
                f64::from(data.get_i16()) / 10.0,
                f64::from(data.get_i16()) / 10.0,
                f64::from(data.get_i16()) / 10.0,
            )
        }))
    }

    /// Drive along an arc of `angle` degrees with `radius` centimeters.
    pub async fn arc(&self, angle: f64, radius: f64) -> Result<()> {
        if self.motors_blocked("arc") {
            return Ok(());
        }
        let mut payload = BytesMut::with_capacity(8);
        payload.put_i32(tenths(angle));
        payload.put_i32(tenths(radius));
        self.acknowledged(1, 27, &payload).await
    }

    /// Move the marker, taking a [`Marker`](crate::types::Marker) or a raw
    /// code that is clamped to the valid range.
    pub async fn set_marker(&self, position: impl Into<i32>) -> Result<()> {
        if self.motors_blocked("set_marker") {
            return Ok(());
        }
        let position = position.into().clamp(0, 2) as u8;
        self.acknowledged(2, 0, &[position]).await
    }

    // --- Lights and sensors ---

    pub async fn set_lights(&self, red: i32, green: i32, blue: i32, animation: impl Into<i32>) -> Result<()> {
        let payload = [
            animation.into().clamp(0, 3) as u8,
            red.clamp(0, 255) as u8,
            green.clamp(0, 255) as u8,
            blue.clamp(0, 255) as u8,
        ];
        self.send(3, 2, &payload).await
    }

    /// Raw readings of one bank of eight color sensors.
    pub async fn get_color_sensor_data(
        &self,
        bank: impl Into<i32>,
        lighting: impl Into<i32>,
        format: impl Into<i32>,
    ) -> Result<Vec<u16>> {
        let payload = [
            bank.into().clamp(0, 3) as u8,
            lighting.into().clamp(0, 4) as u8,
            format.into().clamp(0, 1) as u8,
        ];
        let reply = self.query(4, 1, &payload).await?;
        Ok(reply
            .map(|p| {
                let mut data = &p.payload[..];
                (0..8).map(|_| data.get_u16()).collect()
            })
            .unwrap_or_default())
    }

    /// Ambient light as (left mV, right mV).
    pub async fn get_light_sensor_data(&self) -> Result<(u16, u16)> {
        let reply = self.query(13, 1, &[]).await?;
        Ok(reply.map_or((0, 0), |p| {
            let mut data = &p.payload[4..8];
            (data.get_u16(), data.get_u16())
        }))
    }

    /// Battery as (mV, percent).
    pub async fn get_battery_level(&self) -> Result<(u16, u8)> {
        let reply = self.query(14, 1, &[]).await?;
        Ok(reply.map_or((0, 0), |p| {
            let mut data = &p.payload[4..7];
            (data.get_u16(), data.get_u8())
        }))
    }

    /// Acceleration as (x, y, z) in g.
    pub async fn get_accelerometer(&self) -> Result<(f64, f64, f64)> {
        let reply = self.query(16, 1, &[]).await?;
        Ok(reply.map_or((0.0, 0.0, 0.0), |p| {
            let mut data = &p.payload[4..10];
            (
                f64::from(data.get_i16()) / 1000.0,
                f64::from(data.get_i16()) / 1000.0,
                f64::from(data.get_i16()) / 1000.0,
            )
        }))
    }

    // --- Sound ---

    /// Play `frequency` hertz for `duration` seconds and wait until done.
    pub async fn play_note(&self, frequency: f64, duration: f64) -> Result<()> {
        let mut payload = BytesMut::with_capacity(6);
        payload.put_u32(magnitude_u32(frequency as i64));
        payload.put_u16(magnitude_u16(thousandths(duration)));
        self.acknowledged(5, 0, &payload).await
    }

    /// Play a note given by name, e.g. `"C#5"`, tuned to the configured A4.
    pub async fn play_named_note(&self, name: &str, duration: f64) -> Result<()> {
        let frequency = note_with_reference(name, self.inner.config.reference_pitch_hz)?;
        self.play_note(frequency, duration).await
    }

    pub async fn stop_note(&self) -> Result<()> {
        self.send(5, 1, &[]).await
    }

    /// Say a phrase in robot language, one payload-sized chunk at a time.
    pub async fn say(&self, phrase: &str) -> Result<()> {
        for chunk in phrase.as_bytes().chunks(PAYLOAD_LEN) {
            self.acknowledged(5, 4, chunk).await?;
        }
        Ok(())
    }

    pub async fn stop_saying(&self) -> Result<()> {
        self.stop_note().await
    }

    pub async fn play_sweep(&self, sweep: &Sweep) -> Result<()> {
        self.acknowledged(5, 5, &sweep.payload()).await
    }
}
