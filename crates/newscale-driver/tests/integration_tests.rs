//! End-to-end driver tests against an in-memory transceiver emulator.
//!
//! The emulator models the hub's routing behavior: one selected axis at
//! a time, stage frames applied to whichever axis the last `TR<A0>`
//! picked. Per-axis behavior is configurable so fault and timeout paths
//! can be exercised without hardware.

use newscale_driver::protocol::{ticks_to_um, Direction, StateBit};
use newscale_driver::{
    Address, AxisTarget, GroupOutcome, Interface, M3LinearSmartStage, MultiStage,
    MultiStageConfig, StageError, StageSettings,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

#[derive(Clone, Copy)]
enum Behavior {
    /// Report running for a fixed number of polls, then on-target.
    Normal { polls_to_settle: u32 },
    /// Every move ends in a stall.
    StallOnMove,
    /// Accept moves but never answer a closed-loop-state poll.
    SilentOnPoll,
}

struct AxisSim {
    behavior: Behavior,
    position_ticks: i32,
    target_ticks: i32,
    polls_left: u32,
    stalled: bool,
    halts: usize,
    open_loop_speed: u8,
}

impl AxisSim {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            position_ticks: 0,
            target_ticks: 0,
            polls_left: 0,
            stalled: false,
            halts: 0,
            open_loop_speed: 0xFF,
        }
    }

    fn start_move(&mut self, target_ticks: i32) {
        self.target_ticks = target_ticks;
        match self.behavior {
            Behavior::Normal { polls_to_settle } => self.polls_left = polls_to_settle,
            Behavior::StallOnMove => self.stalled = true,
            Behavior::SilentOnPoll => {}
        }
    }

    fn status(&mut self) -> u32 {
        if self.stalled {
            StateBit::Stalled.mask() | StateBit::Running.mask()
        } else if self.polls_left > 0 {
            self.polls_left -= 1;
            StateBit::Running.mask() | StateBit::MovingTowardTarget.mask()
        } else {
            self.position_ticks = self.target_ticks;
            StateBit::OnTarget.mask()
        }
    }
}

struct Emulator {
    axes: HashMap<u8, AxisSim>,
    selected: Option<u8>,
    halt_count: Arc<AtomicUsize>,
}

impl Emulator {
    fn spawn(
        stream: DuplexStream,
        behaviors: Vec<(u8, Behavior)>,
    ) -> (Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
        let halt_count = Arc::new(AtomicUsize::new(0));
        let mut emu = Self {
            axes: behaviors
                .into_iter()
                .map(|(addr, b)| (addr, AxisSim::new(b)))
                .collect(),
            selected: None,
            halt_count: Arc::clone(&halt_count),
        };
        let handle = tokio::spawn(async move {
            emu.run(stream).await;
        });
        (halt_count, handle)
    }

    async fn run(&mut self, mut stream: DuplexStream) {
        let mut frame = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            frame.clear();
            loop {
                match stream.read_exact(&mut byte).await {
                    Ok(_) => {}
                    Err(_) => return, // host hung up
                }
                frame.push(byte[0]);
                if byte[0] == b'\r' {
                    break;
                }
            }
            let text = String::from_utf8(frame.clone()).unwrap();
            if let Some(reply) = self.handle(text.trim_end_matches('\r')) {
                stream.write_all(reply.as_bytes()).await.unwrap();
            }
        }
    }

    fn handle(&mut self, frame: &str) -> Option<String> {
        // Hub commands.
        if let Some(rest) = frame.strip_prefix("TR<A0 ") {
            let addr = u8::from_str_radix(rest.trim_end_matches('>'), 16).unwrap();
            self.selected = Some(addr);
            return Some(format!("TR<A0 {addr:02X} 1>\r"));
        }
        let body = frame
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or_else(|| panic!("unexpected frame {frame:?}"));
        let axis = self
            .axes
            .get_mut(&self.selected.expect("stage frame before select"))
            .expect("frame for unconfigured axis");
        let (opcode, args) = body.split_once(' ').unwrap_or((body, ""));
        match opcode {
            "01" => Some("<01 4 M3-LS-3.4-15 R4.02>\r".to_string()),
            "20" => Some(format!("<{body}>\r")),
            "02" | "07" => Some(format!("<{opcode}>\r")),
            "03" => {
                axis.halts += 1;
                self.halt_count.fetch_add(1, Ordering::SeqCst);
                Some("<03>\r".to_string())
            }
            "08" => {
                if args.is_empty() {
                    return Some(format!("<08 {:08X}>\r", axis.target_ticks as u32));
                }
                let ticks = u32::from_str_radix(args, 16).unwrap() as i32;
                axis.start_move(ticks);
                Some(format!("<{body}>\r"))
            }
            "04" => {
                // Timed or open-ended run; model it as a fixed travel of
                // 1000 ticks in the commanded direction.
                let dir = args.split(' ').next().unwrap();
                let delta = if dir == "0" { -1000 } else { 1000 };
                let target = axis.position_ticks + delta;
                axis.start_move(target);
                Some(format!("<{body}>\r"))
            }
            "09" => {
                if args.is_empty() {
                    return Some(format!("<09 {:02X}>\r", axis.open_loop_speed));
                }
                axis.open_loop_speed = u8::from_str_radix(args, 16).unwrap();
                Some(format!("<{body}>\r"))
            }
            "06" => {
                // Relative step: direction nibble then tick count.
                let (dir, ticks) = args.split_once(' ').unwrap();
                let magnitude = u32::from_str_radix(ticks, 16).unwrap() as i32;
                let delta = if dir == "0" { -magnitude } else { magnitude };
                let target = axis.position_ticks + delta;
                axis.start_move(target);
                Some(format!("<{body}>\r"))
            }
            "10" => {
                if matches!(axis.behavior, Behavior::SilentOnPoll) {
                    return None;
                }
                let status = axis.status();
                Some(format!(
                    "<10 {status:06X} {:08X} 00000000>\r",
                    axis.position_ticks as u32
                ))
            }
            "19" => {
                let status = axis.status() & 0xFFFF;
                Some(format!("<19 {status:04X}>\r"))
            }
            other => panic!("emulator has no script for opcode {other:?}"),
        }
    }
}

fn fast_settings() -> StageSettings {
    StageSettings {
        reply_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(2),
        move_timeout: Duration::from_millis(800),
    }
}

async fn open_axes(
    behaviors: Vec<(u8, Behavior)>,
) -> (Interface, Vec<Arc<M3LinearSmartStage>>, Arc<AtomicUsize>) {
    let (host, device) = tokio::io::duplex(4096);
    let addresses: Vec<u8> = behaviors.iter().map(|(a, _)| *a).collect();
    let (halts, _task) = Emulator::spawn(host, behaviors);
    let interface = Interface::from_stream(device, "emu");
    let mut stages = Vec::new();
    for addr in addresses {
        let stage =
            M3LinearSmartStage::open(interface.clone(), Address::new(addr), fast_settings())
                .await
                .unwrap();
        stages.push(Arc::new(stage));
    }
    (interface, stages, halts)
}

#[tokio::test]
async fn blocking_moves_on_one_link_are_address_isolated() {
    let (_iface, stages, _halts) = open_axes(vec![
        (1, Behavior::Normal { polls_to_settle: 3 }),
        (2, Behavior::Normal { polls_to_settle: 5 }),
    ])
    .await;

    // Both axes share the link; their polls interleave through the same
    // mutex and each must only ever see its own replies.
    let a = Arc::clone(&stages[0]);
    let b = Arc::clone(&stages[1]);
    let (ra, rb) = tokio::join!(
        a.move_absolute_blocking(100.0),
        b.move_absolute_blocking(-250.0),
    );
    assert_eq!(ra.unwrap(), 100.0);
    assert_eq!(rb.unwrap(), -250.0);
    assert_eq!(a.get_position().await.unwrap(), 100.0);
    assert_eq!(b.get_position().await.unwrap(), -250.0);
}

#[tokio::test]
async fn group_move_reports_partial_failure_with_survivors() {
    let (_iface, stages, _halts) = open_axes(vec![
        (1, Behavior::Normal { polls_to_settle: 2 }),
        (2, Behavior::StallOnMove),
        (3, Behavior::Normal { polls_to_settle: 2 }),
    ])
    .await;
    let group = MultiStage::new(vec![
        ("x", Arc::clone(&stages[0])),
        ("y", Arc::clone(&stages[1])),
        ("z", Arc::clone(&stages[2])),
    ])
    .unwrap();

    let report = group
        .move_absolute(&[("x", 100.0), ("y", 200.0), ("z", 300.0)], true)
        .await
        .unwrap();

    match &report.outcome {
        GroupOutcome::PartialFailure { failed, succeeded } => {
            assert_eq!(failed, &["y".to_string()]);
            assert_eq!(succeeded, &["x".to_string(), "z".to_string()]);
        }
        other => panic!("expected PartialFailure, got {other:?}"),
    }
    // Survivors stay where they landed, and the faulted axis carries its
    // status word out.
    for (name, result) in &report.axes {
        match name.as_str() {
            "x" => assert_eq!(*result.as_ref().unwrap(), Some(100.0)),
            "z" => assert_eq!(*result.as_ref().unwrap(), Some(300.0)),
            "y" => match result {
                Err(StageError::CommandFailed {
                    status: Some(status),
                    ..
                }) => assert!(status.stalled()),
                other => panic!("expected stall failure, got {other:?}"),
            },
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn timeout_on_one_link_does_not_stall_another() {
    // Two independent links: a responsive axis and a silent one.
    let (_iface_a, good, _h1) =
        open_axes(vec![(1, Behavior::Normal { polls_to_settle: 2 })]).await;
    let (_iface_b, silent, _h2) = open_axes(vec![(1, Behavior::SilentOnPoll)]).await;
    let group = MultiStage::new(vec![
        ("a", Arc::clone(&good[0])),
        ("b", Arc::clone(&silent[0])),
    ])
    .unwrap();

    let started = tokio::time::Instant::now();
    let report = group
        .move_group(
            &[
                AxisTarget::absolute("a", 50.0),
                AxisTarget::absolute("b", 50.0),
            ],
            true,
        )
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        GroupOutcome::TimedOut {
            pending: vec!["b".to_string()]
        }
    );
    let (_, a_result) = &report.axes[0];
    assert_eq!(*a_result.as_ref().unwrap(), Some(50.0));
    // The good axis settles on its own schedule; the silent link's
    // timeout never serializes behind it.
    assert!(started.elapsed() < fast_settings().move_timeout);
}

#[tokio::test]
async fn stop_group_reaches_every_axis() {
    let (_iface, stages, halts) = open_axes(vec![
        (1, Behavior::Normal { polls_to_settle: 50 }),
        (2, Behavior::Normal { polls_to_settle: 50 }),
        (3, Behavior::Normal { polls_to_settle: 50 }),
    ])
    .await;
    let group = MultiStage::new(vec![
        ("x", Arc::clone(&stages[0])),
        ("y", Arc::clone(&stages[1])),
        ("z", Arc::clone(&stages[2])),
    ])
    .unwrap();

    group
        .move_absolute(&[("x", 100.0), ("y", 100.0), ("z", 100.0)], false)
        .await
        .unwrap();
    let results = group.stop_group().await;
    assert_eq!(results.len(), 3);
    for (_, result) in &results {
        result.as_ref().unwrap();
    }
    assert_eq!(halts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn timed_group_run_stops_every_axis() {
    let (_iface, stages, _halts) = open_axes(vec![
        (1, Behavior::Normal { polls_to_settle: 2 }),
        (2, Behavior::Normal { polls_to_settle: 3 }),
    ])
    .await;
    let group = MultiStage::new(vec![
        ("x", Arc::clone(&stages[0])),
        ("y", Arc::clone(&stages[1])),
    ])
    .unwrap();

    let report = group
        .move_for_time(
            &[
                ("x", Direction::Forward, Some(0.5)),
                ("y", Direction::Backward, Some(0.5)),
            ],
            true,
        )
        .await
        .unwrap();
    assert!(report.is_complete());
    // The emulator models a run as 1000 ticks of travel.
    assert_eq!(report.axes[0].1.as_ref().unwrap(), &Some(500.0));
    assert_eq!(report.axes[1].1.as_ref().unwrap(), &Some(-500.0));
}

#[tokio::test]
async fn group_fanouts_touch_every_axis() {
    let (_iface, stages, _halts) = open_axes(vec![
        (1, Behavior::Normal { polls_to_settle: 1 }),
        (2, Behavior::Normal { polls_to_settle: 1 }),
    ])
    .await;
    let group = MultiStage::new(vec![
        ("x", Arc::clone(&stages[0])),
        ("y", Arc::clone(&stages[1])),
    ])
    .unwrap();

    for (_, result) in group.set_open_loop_speed(50.0).await {
        result.unwrap();
    }
    for (name, speed) in group.get_open_loop_speed().await {
        let speed = speed.unwrap();
        assert!((speed - 50.0).abs() < 0.5, "{name}: {speed}");
    }
    for (_, result) in group.set_open_loop_mode().await {
        result.unwrap();
    }
    for (_, result) in group.set_closed_loop_mode().await {
        result.unwrap();
    }
    for (_, result) in group.close().await {
        result.unwrap();
    }
}

#[tokio::test]
async fn relative_moves_accumulate() {
    let (_iface, stages, _halts) =
        open_axes(vec![(1, Behavior::Normal { polls_to_settle: 1 })]).await;
    let stage = &stages[0];
    stage.move_relative_blocking(100.0).await.unwrap();
    stage.move_relative_blocking(-25.5).await.unwrap();
    assert_eq!(stage.get_position().await.unwrap(), 74.5);
    // Tick granularity is half a micrometer.
    assert_eq!(ticks_to_um(149), 74.5);
}

#[tokio::test]
async fn config_connects_a_whole_group_over_one_link() {
    let text = r#"
        [interface]
        kind = "serial"
        port = "/dev/ttyUSB0"

        [timing]
        reply_timeout_ms = 200
        poll_interval_ms = 2
        move_timeout_ms = 800

        [[axes]]
        name = "x"
        address = 1

        [[axes]]
        name = "y"
        address = 2
    "#;
    let config = MultiStageConfig::from_toml(text).unwrap();

    let (host, device) = tokio::io::duplex(4096);
    let (_halts, _task) = Emulator::spawn(
        host,
        vec![
            (1, Behavior::Normal { polls_to_settle: 1 }),
            (2, Behavior::Normal { polls_to_settle: 1 }),
        ],
    );
    let group = config
        .connect_on(Interface::from_stream(device, "emu"))
        .await
        .unwrap();
    assert_eq!(group.axis_names().collect::<Vec<_>>(), vec!["x", "y"]);

    let report = group
        .move_absolute(&[("x", 10.0), ("y", 20.0)], true)
        .await
        .unwrap();
    assert!(report.is_complete());
    assert!(group
        .get_group_status()
        .iter()
        .all(|(_, status)| status.map(|s| s.on_target()).unwrap_or(false)));
}
