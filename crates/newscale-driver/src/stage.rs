//! Driver for a single M3-LS linear smart stage axis.
//!
//! Every operation is one request/response transaction on the shared
//! [`Interface`]; blocking variants poll the closed-loop state between
//! transactions with the link lock released, so sibling axes on the same
//! link keep making progress while one axis waits.

use crate::error::StageError;
use crate::interface::{Address, Interface};
use newscale_protocol::{
    ticks_to_um, ClosedLoopSpeed, Direction, DriveMode, ProtocolError, StageCommand, StageReply,
    StatusWord,
};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// Tunable timing for one axis. No hidden constants: callers see and set
/// every deadline the driver applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSettings {
    /// Deadline for a single reply frame.
    pub reply_timeout: Duration,
    /// Delay between status polls while waiting for motion to finish.
    pub poll_interval: Duration,
    /// Overall deadline for a blocking move or homing run.
    pub move_timeout: Duration,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            move_timeout: Duration::from_secs(30),
        }
    }
}

/// Where the axis last ended up, from the driver's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AxisOutcome {
    /// No motion in progress.
    #[default]
    Idle,
    /// Motion commanded, completion not yet observed.
    Moving,
    /// Last commanded motion reached its target.
    OnTarget,
    /// Last commanded motion ended in a fault (stall, encoder error,
    /// unresponsive driver). Sticky until the device clears it.
    Fault,
    /// Last blocking wait lapsed with the axis still moving.
    TimedOut,
}

/// Cached view of the axis, updated only after confirmed replies.
/// Readable at any time without touching the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct AxisState {
    pub position_um: Option<f64>,
    pub status: Option<StatusWord>,
    pub outcome: AxisOutcome,
}

/// Decoded `<10>` reply in physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedLoopState {
    pub status: StatusWord,
    pub position_um: f64,
    /// Servo error (target minus actual), micrometers.
    pub error_um: f64,
}

/// One M3-LS axis behind a shared interface.
///
/// Opening the driver performs the host-control handshake (firmware
/// version query) and switches the axis to closed-loop drive mode.
pub struct M3LinearSmartStage {
    interface: Interface,
    address: Address,
    settings: StageSettings,
    firmware: String,
    state: Mutex<AxisState>,
    interval_us: Mutex<Option<f64>>,
}

impl M3LinearSmartStage {
    #[instrument(skip(interface, settings), fields(iface = interface.label(), axis = %address), err)]
    pub async fn open(
        interface: Interface,
        address: Address,
        settings: StageSettings,
    ) -> Result<Self, StageError> {
        let stage = Self {
            interface,
            address,
            settings,
            firmware: String::new(),
            state: Mutex::new(AxisState::default()),
            interval_us: Mutex::new(None),
        };
        // The version query doubles as the host-control handshake.
        let firmware = match stage.transact(&StageCommand::FirmwareVersion).await? {
            StageReply::FirmwareVersion { version, info } => format!("{version} {info}"),
            StageReply::Ack(_) => String::new(),
            other => return Err(unexpected(&StageCommand::FirmwareVersion, &other)),
        };
        stage.set_drive_mode(DriveMode::ClosedLoop).await?;
        tracing::info!(firmware, "stage online");
        Ok(Self { firmware, ..stage })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn settings(&self) -> StageSettings {
        self.settings
    }

    /// Firmware identification captured during the open handshake.
    pub fn firmware_version(&self) -> &str {
        &self.firmware
    }

    /// Last confirmed axis state. No I/O.
    pub fn last_state(&self) -> AxisState {
        *self.state.lock()
    }

    // -------------------------------------------------------------------------
    // Motion
    // -------------------------------------------------------------------------

    /// Command an absolute move and return on acknowledgement.
    #[instrument(skip(self), fields(axis = %self.address), err)]
    pub async fn move_absolute(&self, target_um: f64) -> Result<(), StageError> {
        let cmd = StageCommand::move_to_target(target_um)?;
        match self.transact(&cmd).await {
            Ok(StageReply::TargetPosition { .. } | StageReply::Ack(_)) => {
                self.state.lock().outcome = AxisOutcome::Moving;
                Ok(())
            }
            Ok(other) => Err(unexpected(&cmd, &other)),
            Err(err) => Err(self.command_failed(err)),
        }
    }

    /// Command a relative move (closed-loop step) and return on
    /// acknowledgement.
    #[instrument(skip(self), fields(axis = %self.address), err)]
    pub async fn move_relative(&self, delta_um: f64) -> Result<(), StageError> {
        let cmd = StageCommand::distance_step(delta_um)?;
        match self.transact(&cmd).await {
            Ok(StageReply::Ack(_)) => {
                self.state.lock().outcome = AxisOutcome::Moving;
                Ok(())
            }
            Ok(other) => Err(unexpected(&cmd, &other)),
            Err(err) => Err(self.command_failed(err)),
        }
    }

    /// Absolute move, polling until the axis settles on target. Returns
    /// the final position.
    pub async fn move_absolute_blocking(&self, target_um: f64) -> Result<f64, StageError> {
        self.move_absolute(target_um).await?;
        self.wait_settled(Instant::now() + self.settings.move_timeout)
            .await
    }

    /// Relative move, polling until the axis settles on target. Returns
    /// the final position.
    pub async fn move_relative_blocking(&self, delta_um: f64) -> Result<f64, StageError> {
        self.move_relative(delta_um).await?;
        self.wait_settled(Instant::now() + self.settings.move_timeout)
            .await
    }

    /// Drive toward the reverse hard stop. [`home_blocking`] runs the
    /// full sequence; this only starts the run.
    ///
    /// [`home_blocking`]: Self::home_blocking
    #[instrument(skip(self), fields(axis = %self.address), err)]
    pub async fn home(&self) -> Result<(), StageError> {
        let cmd = StageCommand::run(Direction::Backward, None)?;
        match self.transact(&cmd).await {
            Ok(StageReply::Ack(_)) => {
                self.state.lock().outcome = AxisOutcome::Moving;
                Ok(())
            }
            Ok(other) => Err(unexpected(&cmd, &other)),
            Err(err) => Err(self.command_failed(err)),
        }
    }

    /// Home against the reverse hard stop and make it position zero:
    /// run backward until the reverse limit (or the stall that stands in
    /// for it at the mechanical stop), halt, clear the encoder count.
    #[instrument(skip(self), fields(axis = %self.address), err)]
    pub async fn home_blocking(&self) -> Result<(), StageError> {
        self.home().await?;
        let deadline = Instant::now() + self.settings.move_timeout;
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            let state = self.poll_state().await?;
            if state.status.reverse_limit_reached() || state.status.stalled() {
                break;
            }
            if state.status.has_fault() {
                self.state.lock().outcome = AxisOutcome::Fault;
                return Err(StageError::CommandFailed {
                    status: Some(state.status),
                    source: None,
                });
            }
            if Instant::now() >= deadline {
                self.state.lock().outcome = AxisOutcome::TimedOut;
                return Err(StageError::CommandFailed {
                    status: Some(state.status),
                    source: Some(Box::new(StageError::Timeout {
                        timeout: self.settings.move_timeout,
                    })),
                });
            }
        }
        self.stop().await?;
        self.clear_encoder_count().await?;
        let mut state = self.state.lock();
        state.position_um = Some(0.0);
        state.outcome = AxisOutcome::OnTarget;
        Ok(())
    }

    /// Halt the axis. Safe at any time, including mid-move.
    #[instrument(skip(self), fields(axis = %self.address), err)]
    pub async fn stop(&self) -> Result<(), StageError> {
        match self.transact(&StageCommand::Halt).await? {
            StageReply::Ack(_) => Ok(()),
            other => Err(unexpected(&StageCommand::Halt, &other)),
        }
    }

    /// Run the motor in a direction, open-ended or for a fixed number of
    /// seconds (tenth-second resolution, 25.5 s maximum).
    #[instrument(skip(self), fields(axis = %self.address), err)]
    pub async fn run(&self, direction: Direction, seconds: Option<f64>) -> Result<(), StageError> {
        let cmd = StageCommand::run(direction, seconds)?;
        match self.transact(&cmd).await? {
            StageReply::Ack(_) => {
                self.state.lock().outcome = AxisOutcome::Moving;
                Ok(())
            }
            other => Err(unexpected(&cmd, &other)),
        }
    }

    /// Store a step size without stepping.
    pub async fn set_step_size(&self, step_um: f64) -> Result<(), StageError> {
        let cmd = StageCommand::set_step_size(step_um)?;
        self.expect_ack(&cmd).await
    }

    /// Repeat the previously stored step in the given direction.
    pub async fn step_again(&self, direction: Direction) -> Result<(), StageError> {
        let cmd = StageCommand::step_again(direction);
        self.expect_ack(&cmd).await?;
        self.state.lock().outcome = AxisOutcome::Moving;
        Ok(())
    }

    /// Poll until the axis settles on target, faults, or the deadline
    /// lapses. The link lock is released between polls.
    pub async fn wait_settled(&self, deadline: Instant) -> Result<f64, StageError> {
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            let state = self.poll_state().await?;
            if state.status.has_fault() {
                self.state.lock().outcome = AxisOutcome::Fault;
                return Err(StageError::CommandFailed {
                    status: Some(state.status),
                    source: None,
                });
            }
            if state.status.settled() {
                self.state.lock().outcome = AxisOutcome::OnTarget;
                return Ok(state.position_um);
            }
            if Instant::now() >= deadline {
                self.state.lock().outcome = AxisOutcome::TimedOut;
                return Err(StageError::CommandFailed {
                    status: Some(state.status),
                    source: Some(Box::new(StageError::Timeout {
                        timeout: self.settings.move_timeout,
                    })),
                });
            }
        }
    }

    /// Poll until a timed or open-ended run finishes, faults, or the
    /// deadline lapses. Returns the position where the motor stopped.
    pub async fn wait_stopped(&self, deadline: Instant) -> Result<f64, StageError> {
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            let state = self.poll_state().await?;
            if state.status.has_fault() {
                self.state.lock().outcome = AxisOutcome::Fault;
                return Err(StageError::CommandFailed {
                    status: Some(state.status),
                    source: None,
                });
            }
            if !state.status.is_running() && !state.status.timed_run() {
                self.state.lock().outcome = AxisOutcome::Idle;
                return Ok(state.position_um);
            }
            if Instant::now() >= deadline {
                self.state.lock().outcome = AxisOutcome::TimedOut;
                return Err(StageError::CommandFailed {
                    status: Some(state.status),
                    source: Some(Box::new(StageError::Timeout {
                        timeout: self.settings.move_timeout,
                    })),
                });
            }
        }
    }

    /// One status poll for a wait loop. A transaction failure here is a
    /// failure of the motion being waited on: the cached outcome is
    /// updated and the error carries the last known status word.
    async fn poll_state(&self) -> Result<ClosedLoopState, StageError> {
        match self.get_closed_loop_state().await {
            Ok(state) => Ok(state),
            Err(err) => {
                self.state.lock().outcome = if err.is_timeout() {
                    AxisOutcome::TimedOut
                } else {
                    AxisOutcome::Fault
                };
                Err(self.command_failed(err))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Status and position
    // -------------------------------------------------------------------------

    /// Motor status word (`<19>`, low 16 bits of the shared layout).
    /// Idempotent; updates the cached state.
    pub async fn get_status(&self) -> Result<StatusWord, StageError> {
        match self.transact(&StageCommand::MotorStatus).await? {
            StageReply::MotorStatus { status } => {
                self.state.lock().status = Some(status);
                Ok(status)
            }
            other => Err(unexpected(&StageCommand::MotorStatus, &other)),
        }
    }

    /// Full closed-loop state: status word, position, servo error.
    pub async fn get_closed_loop_state(&self) -> Result<ClosedLoopState, StageError> {
        match self.transact(&StageCommand::ClosedLoopState).await? {
            StageReply::ClosedLoopState {
                status,
                position_ticks,
                error_ticks,
            } => {
                let snapshot = ClosedLoopState {
                    status,
                    position_um: ticks_to_um(position_ticks),
                    error_um: ticks_to_um(error_ticks),
                };
                let mut state = self.state.lock();
                state.status = Some(status);
                state.position_um = Some(snapshot.position_um);
                Ok(snapshot)
            }
            other => Err(unexpected(&StageCommand::ClosedLoopState, &other)),
        }
    }

    /// Current position in micrometers.
    pub async fn get_position(&self) -> Result<f64, StageError> {
        Ok(self.get_closed_loop_state().await?.position_um)
    }

    /// The last commanded target, in micrometers.
    pub async fn get_target_position(&self) -> Result<f64, StageError> {
        match self.transact(&StageCommand::GetTargetPosition).await? {
            StageReply::TargetPosition { ticks } => Ok(ticks_to_um(ticks)),
            other => Err(unexpected(&StageCommand::GetTargetPosition, &other)),
        }
    }

    /// Zero the encoder count at the current position.
    pub async fn clear_encoder_count(&self) -> Result<(), StageError> {
        self.expect_ack(&StageCommand::ClearEncoderCount).await?;
        self.state.lock().position_um = Some(0.0);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Speed, drive mode, limits
    // -------------------------------------------------------------------------

    /// Open-loop speed as a percentage of full scale.
    pub async fn set_open_loop_speed(&self, percent: f64) -> Result<(), StageError> {
        let cmd = StageCommand::open_loop_speed(percent)?;
        match self.transact(&cmd).await? {
            StageReply::OpenLoopSpeed { .. } | StageReply::Ack(_) => Ok(()),
            other => Err(unexpected(&cmd, &other)),
        }
    }

    pub async fn get_open_loop_speed(&self) -> Result<f64, StageError> {
        match self.transact(&StageCommand::GetOpenLoopSpeed).await? {
            StageReply::OpenLoopSpeed { speed } => Ok(speed as f64 / 255.0 * 100.0),
            other => Err(unexpected(&StageCommand::GetOpenLoopSpeed, &other)),
        }
    }

    /// Closed-loop velocity, acceleration, and minimum velocity, all in
    /// micrometer units.
    #[instrument(skip(self), fields(axis = %self.address), err)]
    pub async fn set_closed_loop_speed(
        &self,
        velocity_um_per_s: f64,
        acceleration_um_per_s2: f64,
        min_velocity_um_per_s: f64,
    ) -> Result<(), StageError> {
        let cmd = StageCommand::closed_loop_speed(
            velocity_um_per_s,
            acceleration_um_per_s2,
            min_velocity_um_per_s,
        )?;
        match self.transact(&cmd).await? {
            StageReply::ClosedLoopSpeed { .. } | StageReply::Ack(_) => Ok(()),
            other => Err(unexpected(&cmd, &other)),
        }
    }

    pub async fn get_closed_loop_speed(&self) -> Result<ClosedLoopSpeed, StageError> {
        match self.transact(&StageCommand::GetClosedLoopSpeed).await? {
            StageReply::ClosedLoopSpeed { registers } => Ok(registers.to_physical()),
            other => Err(unexpected(&StageCommand::GetClosedLoopSpeed, &other)),
        }
    }

    pub async fn set_drive_mode(&self, mode: DriveMode) -> Result<(), StageError> {
        let cmd = StageCommand::SetDriveMode { mode };
        match self.transact(&cmd).await? {
            StageReply::DriveMode { mode: echoed } if echoed == mode => Ok(()),
            StageReply::Ack(_) => Ok(()),
            other => Err(unexpected(&cmd, &other)),
        }
    }

    pub async fn get_drive_mode(&self) -> Result<DriveMode, StageError> {
        match self.transact(&StageCommand::GetDriveMode).await? {
            StageReply::DriveMode { mode } => Ok(mode),
            other => Err(unexpected(&StageCommand::GetDriveMode, &other)),
        }
    }

    /// Soft travel limits in micrometers with a hysteresis margin.
    pub async fn set_soft_limits(
        &self,
        min_um: f64,
        max_um: f64,
        margin_um: f64,
    ) -> Result<(), StageError> {
        let cmd = StageCommand::soft_limits(min_um, max_um, margin_um)?;
        match self.transact(&cmd).await? {
            StageReply::SoftLimits { .. } | StageReply::Ack(_) => Ok(()),
            other => Err(unexpected(&cmd, &other)),
        }
    }

    /// Soft limits as `(min_um, max_um, margin_um)`.
    pub async fn get_soft_limits(&self) -> Result<(f64, f64, f64), StageError> {
        match self.transact(&StageCommand::GetSoftLimits).await? {
            StageReply::SoftLimits {
                max_ticks,
                min_ticks,
                margin_ticks,
            } => Ok((
                ticks_to_um(min_ticks),
                ticks_to_um(max_ticks),
                margin_ticks as f64 / newscale_protocol::TICKS_PER_UM,
            )),
            other => Err(unexpected(&StageCommand::GetSoftLimits, &other)),
        }
    }

    pub async fn enable_soft_limits(&self) -> Result<(), StageError> {
        self.set_soft_limit_state(true).await
    }

    pub async fn disable_soft_limits(&self) -> Result<(), StageError> {
        self.set_soft_limit_state(false).await
    }

    async fn set_soft_limit_state(&self, enabled: bool) -> Result<(), StageError> {
        let cmd = StageCommand::SetSoftLimitState { enabled };
        match self.transact(&cmd).await? {
            StageReply::SoftLimitState { enabled: echoed } if echoed == enabled => Ok(()),
            StageReply::Ack(_) => Ok(()),
            other => Err(unexpected(&cmd, &other)),
        }
    }

    /// Servo time interval in microseconds. Queried once and cached; the
    /// value is a firmware constant.
    pub async fn get_time_interval_units(&self) -> Result<f64, StageError> {
        if let Some(cached) = *self.interval_us.lock() {
            return Ok(cached);
        }
        match self.transact(&StageCommand::TimeIntervalUnits).await? {
            StageReply::TimeIntervalUnits { interval_us } => {
                *self.interval_us.lock() = Some(interval_us);
                Ok(interval_us)
            }
            other => Err(unexpected(&StageCommand::TimeIntervalUnits, &other)),
        }
    }

    /// Change the axis baud rate. Takes effect device-side immediately;
    /// the caller must reopen the link at the new rate.
    pub async fn set_baud_rate(&self, rate: newscale_protocol::BaudRate) -> Result<(), StageError> {
        let cmd = StageCommand::SetBaudRate { rate };
        match self.transact(&cmd).await? {
            StageReply::BaudRate { rate: echoed } if echoed == rate => Ok(()),
            StageReply::Ack(_) => Ok(()),
            other => Err(unexpected(&cmd, &other)),
        }
    }

    pub async fn get_baud_rate(&self) -> Result<newscale_protocol::BaudRate, StageError> {
        match self.transact(&StageCommand::GetBaudRate).await? {
            StageReply::BaudRate { rate } => Ok(rate),
            other => Err(unexpected(&StageCommand::GetBaudRate, &other)),
        }
    }

    /// Release host control so the device front panel works again.
    #[instrument(skip(self), fields(axis = %self.address), err)]
    pub async fn close(&self) -> Result<(), StageError> {
        self.expect_ack(&StageCommand::ReleaseHostControl).await
    }

    // -------------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------------

    async fn transact(&self, cmd: &StageCommand) -> Result<StageReply, StageError> {
        let raw = self
            .interface
            .transact(Some(self.address), &cmd.encode(), self.settings.reply_timeout)
            .await?;
        let reply = StageReply::decode(&raw)?;
        if reply.opcode() != cmd.opcode() {
            return Err(ProtocolError::UnexpectedReply {
                expected: cmd.opcode(),
                got: reply.opcode(),
            }
            .into());
        }
        Ok(reply)
    }

    async fn expect_ack(&self, cmd: &StageCommand) -> Result<(), StageError> {
        match self.transact(cmd).await? {
            StageReply::Ack(_) => Ok(()),
            other => Err(unexpected(cmd, &other)),
        }
    }

    /// Wrap a transaction failure in a `CommandFailed` carrying the last
    /// cached status word. Select and protocol faults pass through so the
    /// caller sees the routing problem directly.
    fn command_failed(&self, err: StageError) -> StageError {
        match err {
            StageError::Timeout { .. } | StageError::Connection(_) => StageError::CommandFailed {
                status: self.state.lock().status,
                source: Some(Box::new(err)),
            },
            other => other,
        }
    }
}

impl std::fmt::Debug for M3LinearSmartStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("M3LinearSmartStage")
            .field("iface", &self.interface.label())
            .field("address", &self.address)
            .finish()
    }
}

fn unexpected(cmd: &StageCommand, reply: &StageReply) -> StageError {
    StageError::Protocol(ProtocolError::UnexpectedReply {
        expected: cmd.opcode(),
        got: reply.opcode(),
    })
}
