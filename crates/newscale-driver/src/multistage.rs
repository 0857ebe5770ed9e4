//! Coordinated motion across named axes.
//!
//! [`MultiStage`] holds back-references to axis drivers; it never owns a
//! transport. Group operations dispatch per axis with
//! `futures::future::join_all`, so axes on distinct links run
//! concurrently while the per-link mutex serializes siblings. Results
//! are collected per axis and aggregated; one failing axis never hides
//! the others.

use crate::error::{GroupError, StageError};
use crate::interface::{Address, Interface};
use crate::stage::{M3LinearSmartStage, StageSettings};
use futures::future::join_all;
use newscale_protocol::{Direction, DriveMode, StatusWord};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::instrument;

/// One axis target inside a group move.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisTarget {
    pub axis: String,
    pub kind: MoveKind,
    pub amount_um: f64,
}

impl AxisTarget {
    pub fn absolute(axis: impl Into<String>, target_um: f64) -> Self {
        Self {
            axis: axis.into(),
            kind: MoveKind::Absolute,
            amount_um: target_um,
        }
    }

    pub fn relative(axis: impl Into<String>, delta_um: f64) -> Self {
        Self {
            axis: axis.into(),
            kind: MoveKind::Relative,
            amount_um: delta_um,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Absolute,
    Relative,
}

/// Aggregate verdict of a group move. Axis names in each variant refer
/// back to the per-axis detail in [`GroupReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    /// Every axis reached its target.
    Complete,
    /// At least one axis faulted or failed to accept its command.
    /// Succeeded axes stay where they landed; there is no rollback.
    PartialFailure {
        failed: Vec<String>,
        succeeded: Vec<String>,
    },
    /// No axis faulted, but some were still moving at the group
    /// deadline. Pending axes are left to resolve; nothing is halted.
    TimedOut { pending: Vec<String> },
}

/// Per-axis detail plus the aggregate outcome of one group operation.
#[derive(Debug)]
pub struct GroupReport {
    pub outcome: GroupOutcome,
    /// One entry per requested axis, in request order. `Some` carries
    /// the final position (µm); `None` means the command was accepted
    /// without waiting, so no final position is known.
    pub axes: Vec<(String, Result<Option<f64>, StageError>)>,
}

impl GroupReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == GroupOutcome::Complete
    }

    fn from_results(axes: Vec<(String, Result<Option<f64>, StageError>)>) -> Self {
        let mut succeeded = Vec::new();
        let mut timed_out = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in &axes {
            match result {
                Ok(_) => succeeded.push(name.clone()),
                Err(err) if err.is_timeout() => timed_out.push(name.clone()),
                Err(_) => failed.push(name.clone()),
            }
        }
        // A hard failure dominates: timeouts fold into the failed set so
        // the caller sees one actionable verdict.
        let outcome = if !failed.is_empty() {
            failed.extend(timed_out);
            GroupOutcome::PartialFailure { failed, succeeded }
        } else if !timed_out.is_empty() {
            GroupOutcome::TimedOut { pending: timed_out }
        } else {
            GroupOutcome::Complete
        };
        Self { outcome, axes }
    }
}

/// A named group of axes, typically the x/y/z of one manipulator.
pub struct MultiStage {
    axes: Vec<(String, Arc<M3LinearSmartStage>)>,
}

impl MultiStage {
    /// Build a group from named axes. Names must be unique, and no two
    /// axes may share an address on the same link.
    pub fn new(
        axes: Vec<(impl Into<String>, Arc<M3LinearSmartStage>)>,
    ) -> Result<Self, GroupError> {
        let axes: Vec<(String, Arc<M3LinearSmartStage>)> = axes
            .into_iter()
            .map(|(name, stage)| (name.into(), stage))
            .collect();
        if axes.is_empty() {
            return Err(GroupError::EmptyGroup);
        }
        for (i, (name, stage)) in axes.iter().enumerate() {
            for (other_name, other) in &axes[i + 1..] {
                if name == other_name {
                    return Err(GroupError::DuplicateName(name.clone()));
                }
                if stage.address() == other.address()
                    && stage.interface().shares_link_with(other.interface())
                {
                    return Err(GroupError::DuplicateAddress {
                        first: name.clone(),
                        second: other_name.clone(),
                        address: stage.address(),
                    });
                }
            }
        }
        Ok(Self { axes })
    }

    pub fn axis_names(&self) -> impl Iterator<Item = &str> {
        self.axes.iter().map(|(name, _)| name.as_str())
    }

    pub fn axis(&self, name: &str) -> Result<&Arc<M3LinearSmartStage>, GroupError> {
        self.axes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, stage)| stage)
            .ok_or_else(|| GroupError::UnknownAxis(name.to_string()))
    }

    /// Group move with per-axis targets. All targets must be of one
    /// kind; a mix of absolute and relative targets is rejected before
    /// any command is sent.
    ///
    /// With `wait`, polls every axis until it settles, faults, or the
    /// group deadline (the largest move timeout among the requested
    /// axes) lapses. Without `wait`, the report only records command
    /// acceptance and carries no final positions.
    #[instrument(skip(self, targets), fields(axes = targets.len()), err)]
    pub async fn move_group(
        &self,
        targets: &[AxisTarget],
        wait: bool,
    ) -> Result<GroupReport, GroupError> {
        if targets.is_empty() {
            return Err(GroupError::EmptyGroup);
        }
        let kind = targets[0].kind;
        if targets.iter().any(|t| t.kind != kind) {
            return Err(GroupError::MixedMoveKinds);
        }
        let stages: Vec<&Arc<M3LinearSmartStage>> = targets
            .iter()
            .map(|t| self.axis(&t.axis))
            .collect::<Result<_, _>>()?;

        let deadline = Instant::now()
            + stages
                .iter()
                .map(|s| s.settings().move_timeout)
                .max()
                .unwrap_or_default();

        let moves = targets.iter().zip(&stages).map(|(target, stage)| async move {
            let dispatched = match kind {
                MoveKind::Absolute => stage.move_absolute(target.amount_um).await,
                MoveKind::Relative => stage.move_relative(target.amount_um).await,
            };
            let result = match dispatched {
                Err(err) => Err(err),
                Ok(()) if wait => stage.wait_settled(deadline).await.map(Some),
                Ok(()) => Ok(None),
            };
            (target.axis.clone(), result)
        });
        Ok(GroupReport::from_results(join_all(moves).await))
    }

    /// Run each axis in a direction, open-ended or for a fixed time.
    /// With `wait`, polls every axis until its motor stops (timed runs
    /// included) or the group deadline lapses.
    #[instrument(skip(self, runs), fields(axes = runs.len()), err)]
    pub async fn move_for_time(
        &self,
        runs: &[(&str, Direction, Option<f64>)],
        wait: bool,
    ) -> Result<GroupReport, GroupError> {
        if runs.is_empty() {
            return Err(GroupError::EmptyGroup);
        }
        let stages: Vec<&Arc<M3LinearSmartStage>> = runs
            .iter()
            .map(|(axis, _, _)| self.axis(axis))
            .collect::<Result<_, _>>()?;

        let deadline = Instant::now()
            + stages
                .iter()
                .map(|s| s.settings().move_timeout)
                .max()
                .unwrap_or_default();

        let moves = runs
            .iter()
            .zip(&stages)
            .map(|((axis, direction, seconds), stage)| async move {
                let result = match stage.run(*direction, *seconds).await {
                    Err(err) => Err(err),
                    Ok(()) if wait => stage.wait_stopped(deadline).await.map(Some),
                    Ok(()) => Ok(None),
                };
                ((*axis).to_string(), result)
            });
        Ok(GroupReport::from_results(join_all(moves).await))
    }

    /// Absolute group move; see [`move_group`](Self::move_group).
    pub async fn move_absolute(
        &self,
        targets: &[(&str, f64)],
        wait: bool,
    ) -> Result<GroupReport, GroupError> {
        let targets: Vec<AxisTarget> = targets
            .iter()
            .map(|(axis, um)| AxisTarget::absolute(*axis, *um))
            .collect();
        self.move_group(&targets, wait).await
    }

    /// Relative group move; see [`move_group`](Self::move_group).
    pub async fn move_relative(
        &self,
        deltas: &[(&str, f64)],
        wait: bool,
    ) -> Result<GroupReport, GroupError> {
        let targets: Vec<AxisTarget> = deltas
            .iter()
            .map(|(axis, um)| AxisTarget::relative(*axis, *um))
            .collect();
        self.move_group(&targets, wait).await
    }

    /// Best-effort halt of every axis. Every stage gets its halt command
    /// regardless of how the others fare; failures are collected, not
    /// short-circuited.
    #[instrument(skip(self))]
    pub async fn stop_group(&self) -> Vec<(String, Result<(), StageError>)> {
        join_all(self.axes.iter().map(|(name, stage)| async move {
            (name.clone(), stage.stop().await)
        }))
        .await
    }

    /// Cached per-axis status snapshot. No I/O; values are whatever the
    /// last confirmed replies reported.
    pub fn get_group_status(&self) -> Vec<(String, Option<StatusWord>)> {
        self.axes
            .iter()
            .map(|(name, stage)| (name.clone(), stage.last_state().status))
            .collect()
    }

    /// Query every axis position.
    pub async fn get_positions(&self) -> Vec<(String, Result<f64, StageError>)> {
        join_all(self.axes.iter().map(|(name, stage)| async move {
            (name.clone(), stage.get_position().await)
        }))
        .await
    }

    /// Apply one closed-loop speed setting to every axis.
    pub async fn set_closed_loop_speed(
        &self,
        velocity_um_per_s: f64,
        acceleration_um_per_s2: f64,
        min_velocity_um_per_s: f64,
    ) -> Vec<(String, Result<(), StageError>)> {
        join_all(self.axes.iter().map(|(name, stage)| async move {
            (
                name.clone(),
                stage
                    .set_closed_loop_speed(
                        velocity_um_per_s,
                        acceleration_um_per_s2,
                        min_velocity_um_per_s,
                    )
                    .await,
            )
        }))
        .await
    }

    /// Apply one open-loop speed (percent of full scale) to every axis.
    pub async fn set_open_loop_speed(&self, percent: f64) -> Vec<(String, Result<(), StageError>)> {
        join_all(self.axes.iter().map(|(name, stage)| async move {
            (name.clone(), stage.set_open_loop_speed(percent).await)
        }))
        .await
    }

    /// Query every axis open-loop speed (percent of full scale).
    pub async fn get_open_loop_speed(&self) -> Vec<(String, Result<f64, StageError>)> {
        join_all(self.axes.iter().map(|(name, stage)| async move {
            (name.clone(), stage.get_open_loop_speed().await)
        }))
        .await
    }

    /// Switch every axis to open-loop drive.
    pub async fn set_open_loop_mode(&self) -> Vec<(String, Result<(), StageError>)> {
        self.set_drive_mode(DriveMode::OpenLoop).await
    }

    /// Switch every axis to closed-loop drive.
    pub async fn set_closed_loop_mode(&self) -> Vec<(String, Result<(), StageError>)> {
        self.set_drive_mode(DriveMode::ClosedLoop).await
    }

    async fn set_drive_mode(&self, mode: DriveMode) -> Vec<(String, Result<(), StageError>)> {
        join_all(self.axes.iter().map(|(name, stage)| async move {
            (name.clone(), stage.set_drive_mode(mode).await)
        }))
        .await
    }

    /// Release host control of every axis. Best-effort, like
    /// [`stop_group`](Self::stop_group).
    pub async fn close(&self) -> Vec<(String, Result<(), StageError>)> {
        join_all(self.axes.iter().map(|(name, stage)| async move {
            (name.clone(), stage.close().await)
        }))
        .await
    }

    /// Apply one soft-limit window to every axis.
    pub async fn set_soft_limits(
        &self,
        min_um: f64,
        max_um: f64,
        margin_um: f64,
    ) -> Vec<(String, Result<(), StageError>)> {
        join_all(self.axes.iter().map(|(name, stage)| async move {
            (
                name.clone(),
                stage.set_soft_limits(min_um, max_um, margin_um).await,
            )
        }))
        .await
    }
}

impl std::fmt::Debug for MultiStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiStage")
            .field("axes", &self.axes.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

/// Open the conventional x/y/z triplet at addresses 01/02/03 behind one
/// interface.
pub async fn open_xyz(
    interface: Interface,
    settings: StageSettings,
) -> Result<MultiStage, StageError> {
    let mut axes = Vec::with_capacity(3);
    for (name, address) in [("x", 1u8), ("y", 2), ("z", 3)] {
        let stage =
            M3LinearSmartStage::open(interface.clone(), Address::new(address), settings).await?;
        axes.push((name, Arc::new(stage)));
    }
    // Addresses are distinct by construction.
    Ok(MultiStage::new(axes).unwrap_or_else(|_| unreachable!()))
}

/// USB hub variant of [`open_xyz`]: open the serial port, then the three
/// axes.
pub async fn open_usb_xyz(
    port_path: &str,
    settings: StageSettings,
) -> Result<MultiStage, StageError> {
    let interface = Interface::serial(port_path, crate::interface::DEFAULT_BAUD).await?;
    open_xyz(interface, settings).await
}

/// PoE variant of [`open_xyz`].
pub async fn open_poe_xyz(host: &str, settings: StageSettings) -> Result<MultiStage, StageError> {
    let interface = Interface::poe(host, crate::interface::DEFAULT_POE_PORT).await?;
    open_xyz(interface, settings).await
}
