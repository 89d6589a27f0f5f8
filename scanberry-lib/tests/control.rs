mod common;

use common::*;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, sleep};

struct Rig {
    control: ScannerControl<RecordingRails, ScriptedConnector>,
    events: UnboundedReceiver<ScannerEvent>,
    rails: RecordingRails,
    transport: ScriptedTransport,
}

fn rig_with(connector: ScriptedConnector) -> Rig {
    init_tracing();
    let rails = RecordingRails::default();
    let transport = connector.transport.clone();
    let (control, events) = ScannerControl::new(rails.clone(), connector, test_config());
    Rig {
        control,
        events,
        rails,
        transport,
    }
}

fn rig() -> Rig {
    rig_with(ScriptedConnector::default())
}

async fn ready_rig() -> Rig {
    let mut rig = rig();
    rig.control.startup();
    wait_for_event(&mut rig.events, Duration::from_secs(8), |e| {
        matches!(e, ScannerEvent::Ready)
    })
    .await;
    assert_eq!(rig.control.state(), ScannerState::Ready);
    rig
}

fn page_replies() -> Vec<Reply> {
    let mut replies: Vec<Reply> = page_stream(1, &jpeg_page(64, 48), 48, 256)
        .into_iter()
        .map(Reply::Data)
        .collect();
    replies.push(Reply::Data(Bytes::from_static(&[0x00, 0x21, 0x01, 0x00])));
    replies.push(Reply::Data(status_packet(StatusDetail::Finished)));
    replies
}

fn has(events: &[ScannerEvent], pred: impl Fn(&ScannerEvent) -> bool) -> bool {
    events.iter().any(pred)
}

#[tokio::test(start_paused = true)]
async fn test_construction_drives_rails_low() {
    let rig = rig();
    assert_eq!(rig.control.state(), ScannerState::PowerDown);
    assert!(!rig.control.can_scan());
    assert_eq!(rig.rails.log().len(), Rail::ALL.len());
    assert!(rig.rails.all_low());
}

#[tokio::test(start_paused = true)]
async fn test_startup_powers_on_presses_button_and_becomes_ready() {
    let mut rig = rig();
    let started = Instant::now();
    rig.control.startup();
    assert_eq!(rig.control.state(), ScannerState::StartingUp);
    assert!(rig.rails.level(Rail::Power));
    assert!(rig.rails.level(Rail::MotorWake));

    sleep(Duration::from_millis(150)).await;
    assert!(rig.rails.level(Rail::Button));
    sleep(Duration::from_millis(100)).await;
    assert!(!rig.rails.level(Rail::Button));
    assert_eq!(rig.control.state(), ScannerState::StartingUp);

    let events = wait_for_event(&mut rig.events, Duration::from_secs(8), |e| {
        matches!(e, ScannerEvent::Ready)
    })
    .await;
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(7) && elapsed < Duration::from_millis(7_100),
        "{elapsed:?}"
    );
    assert!(has(&events, |e| matches!(e, ScannerEvent::StateChanged(ScannerState::StartingUp))));
    assert!(has(&events, |e| matches!(e, ScannerEvent::StateChanged(ScannerState::Ready))));
    assert!(rig.control.can_scan());
    assert_eq!(*rig.control.subscribe_state().borrow(), ScannerState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_startup_while_starting_is_noop() {
    let mut rig = rig();
    rig.control.startup();
    sleep(Duration::from_secs(1)).await;
    rig.control.startup();
    sleep(Duration::from_secs(7)).await;

    let events = drain(&mut rig.events);
    let readies = events.iter().filter(|e| matches!(e, ScannerEvent::Ready)).count();
    assert_eq!(readies, 1);
    assert!(!has(&events, |e| matches!(e, ScannerEvent::Fault(_))));
}

#[tokio::test(start_paused = true)]
async fn test_startup_when_ready_reemits_ready() {
    let mut rig = ready_rig().await;
    rig.control.startup();
    let events = drain(&mut rig.events);
    assert!(has(&events, |e| matches!(e, ScannerEvent::Ready)));
    assert_eq!(rig.control.state(), ScannerState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_scan_refused_unless_ready() {
    let rig = rig();
    assert!(matches!(
        rig.control.scan(false),
        Err(ScanError::NotReady(ScannerState::PowerDown))
    ));
    rig.control.startup();
    assert!(matches!(
        rig.control.scan(false),
        Err(ScanError::NotReady(ScannerState::StartingUp))
    ));
    assert!(rig.transport.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_successful_scan() {
    let mut rig = ready_rig().await;
    rig.transport
        .respond_to("SSP", vec![Reply::Data(ssp_ack())])
        .respond_to("XSC", page_replies());

    rig.control.scan(false).unwrap();
    assert_eq!(rig.control.state(), ScannerState::ScanStarting);
    assert!(matches!(rig.control.scan(false), Err(ScanError::NotReady(_))));

    let events = wait_for_event(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, ScannerEvent::ScanSuccess(_))
    })
    .await;
    assert!(has(&events, |e| matches!(e, ScannerEvent::ScanStarting)));
    assert!(has(&events, |e| {
        matches!(e, ScannerEvent::ScanRunning(d) if *d == Duration::from_millis(10_500))
    }));
    let Some(ScannerEvent::ScanSuccess(page)) = events.last() else {
        panic!("expected a page, got {events:?}");
    };
    assert_eq!((page.width(), page.height()), (64, 48));
    assert_eq!(rig.control.state(), ScannerState::Ready);
    assert_eq!(rig.transport.commands(), vec!["SSP", "XSC"]);
    assert!(String::from_utf8_lossy(&rig.transport.writes()[0]).contains("LONG=OFF\n"));

    // Motor driver slept, paper raised, then both restored
    let log = rig.rails.log();
    let motor_off = log.iter().rposition(|&r| r == (Rail::MotorWake, false)).unwrap();
    let paper_on = log.iter().rposition(|&r| r == (Rail::Paper, true)).unwrap();
    assert_eq!(motor_off + 1, paper_on);
    assert!(!rig.rails.level(Rail::Paper));
    assert!(rig.rails.level(Rail::MotorWake));

    // Side timers were cancelled with the scan
    sleep(Duration::from_secs(20)).await;
    assert!(rig.rails.level(Rail::MotorWake));
    assert!(!has(&drain(&mut rig.events), |e| matches!(e, ScannerEvent::ScanReceiving)));
}

#[tokio::test(start_paused = true)]
async fn test_hundred_row_page_end_to_end() {
    let mut rig = ready_rig().await;
    let mut replies: Vec<Reply> = page_stream(1, &jpeg_page(64, 100), 100, 1 << 20)
        .into_iter()
        .map(Reply::Data)
        .collect();
    replies.push(Reply::Data(status_packet(StatusDetail::Finished)));
    rig.transport
        .respond_to("SSP", vec![Reply::Data(ssp_ack())])
        .respond_to("XSC", replies);

    rig.control.scan(false).unwrap();
    let events = wait_for_event(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, ScannerEvent::ScanSuccess(_) | ScannerEvent::NoPaper)
    })
    .await;
    let successes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ScannerEvent::ScanSuccess(page) => Some(page),
            _ => None,
        })
        .collect();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].height(), 100);
    assert_eq!(rig.control.state(), ScannerState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_stream_reports_no_paper() {
    let mut rig = ready_rig().await;
    let mut replies: Vec<Reply> = page_stream(1, &jpeg_page(64, 100), 100, 1 << 20)
        .into_iter()
        .map(Reply::Data)
        .collect();
    replies.push(Reply::Data(status_packet(StatusDetail::Aborted)));
    rig.transport
        .respond_to("SSP", vec![Reply::Data(ssp_ack())])
        .respond_to("XSC", replies);

    rig.control.scan(false).unwrap();
    let events = wait_for_event(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, ScannerEvent::NoPaper)
    })
    .await;
    assert!(!has(&events, |e| matches!(e, ScannerEvent::ScanSuccess(_))));
    assert_eq!(rig.control.state(), ScannerState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_long_scan_sets_long_flag_and_duration() {
    let mut rig = ready_rig().await;
    rig.transport
        .respond_to("SSP", vec![Reply::Data(ssp_ack())])
        .respond_to("XSC", vec![Reply::Data(status_packet(StatusDetail::Finished))]);
    rig.control.scan(true).unwrap();
    let events = wait_for_event(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, ScannerEvent::NoPaper)
    })
    .await;
    assert!(has(&events, |e| {
        matches!(e, ScannerEvent::ScanRunning(d) if *d == Duration::from_millis(31_500))
    }));
    assert!(String::from_utf8_lossy(&rig.transport.writes()[0]).contains("LONG=ON\n"));
    assert_eq!(rig.control.state(), ScannerState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_paper_deadline_and_motor_timers() {
    let mut rig = ready_rig().await;
    rig.transport
        .respond_to("SSP", vec![Reply::Data(ssp_ack())])
        .respond_to("ABT", vec![Reply::Data(status_packet(StatusDetail::Aborted))]);
    rig.control.scan(false).unwrap();

    // paper_settle, then the timers start together
    sleep(Duration::from_millis(600)).await;
    assert!(rig.rails.level(Rail::Paper));
    assert!(!rig.rails.level(Rail::MotorWake));
    sleep(Duration::from_millis(1_400)).await;
    assert!(rig.rails.level(Rail::MotorWake));
    assert_eq!(rig.control.state(), ScannerState::ScanRunning);

    sleep(Duration::from_millis(9_100)).await;
    assert!(!rig.rails.level(Rail::Paper));
    assert_eq!(rig.control.state(), ScannerState::ScanReceiving);
    sleep(Duration::from_millis(200)).await;
    assert!(!rig.rails.level(Rail::MotorWake));

    wait_for_event(&mut rig.events, Duration::from_secs(6), |e| {
        matches!(e, ScannerEvent::PaperJam)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_paper_jam_soft_aborts_and_reset_recovers() {
    let mut rig = ready_rig().await;
    rig.transport
        .respond_to("SSP", vec![Reply::Data(ssp_ack())])
        .respond_to("ABT", vec![Reply::Data(status_packet(StatusDetail::Aborted))]);
    let started = Instant::now();
    rig.control.scan(false).unwrap();

    let events = wait_for_event(&mut rig.events, Duration::from_secs(20), |e| {
        matches!(e, ScannerEvent::PaperJam)
    })
    .await;
    let elapsed = started.elapsed();
    // paper_settle + scan_max + jam_grace, plus one poll interval
    assert!(
        elapsed >= Duration::from_secs(16) && elapsed < Duration::from_millis(16_300),
        "{elapsed:?}"
    );
    assert!(has(&events, |e| matches!(e, ScannerEvent::ScanReceiving)));
    assert_eq!(rig.control.state(), ScannerState::Paperjam);
    assert_eq!(rig.transport.commands(), vec!["SSP", "XSC", "ABT"]);
    assert_eq!(rig.transport.writes()[2], b"\x1bABT\nEJCT=NO\n\x80".to_vec());
    assert!(rig.rails.level(Rail::MotorWake));
    assert!(!rig.control.can_scan());

    rig.control.startup();
    assert_eq!(rig.control.state(), ScannerState::PowerDown);
    assert!(rig.rails.all_low());
    sleep(Duration::from_millis(1_050)).await;
    assert_eq!(rig.control.state(), ScannerState::StartingUp);
    wait_for_event(&mut rig.events, Duration::from_secs(8), |e| {
        matches!(e, ScannerEvent::Ready)
    })
    .await;
    assert!(rig.control.can_scan());
}

#[tokio::test(start_paused = true)]
async fn test_abort_scan_without_jam_reports_no_paper() {
    let mut rig = ready_rig().await;
    rig.transport
        .respond_to("SSP", vec![Reply::Data(ssp_ack())])
        .respond_to("ABT", vec![Reply::Data(status_packet(StatusDetail::Aborted))]);
    rig.control.scan(false).unwrap();
    sleep(Duration::from_secs(2)).await;
    rig.control.scan_stop();
    assert!(!rig.rails.level(Rail::Paper));
    assert_eq!(rig.control.state(), ScannerState::ScanRunning);
    rig.control.abort_scan();

    wait_for_event(&mut rig.events, Duration::from_secs(1), |e| {
        matches!(e, ScannerEvent::NoPaper)
    })
    .await;
    assert_eq!(rig.control.state(), ScannerState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_worker_fault_powers_down() {
    let mut rig = ready_rig().await;
    rig.transport.respond_to("SSP", vec![Reply::Fail]);
    rig.control.scan(false).unwrap();

    let events = wait_for_event(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, ScannerEvent::Shutdown)
    })
    .await;
    assert!(has(&events, |e| matches!(e, ScannerEvent::Fault(_))));
    assert_eq!(rig.control.state(), ScannerState::PowerDown);
    assert!(rig.rails.all_low());
}

#[tokio::test(start_paused = true)]
async fn test_device_open_failure_powers_down() {
    let mut rig = rig_with(ScriptedConnector {
        fail: true,
        ..Default::default()
    });
    rig.control.startup();
    let events = wait_for_event(&mut rig.events, Duration::from_secs(8), |e| {
        matches!(e, ScannerEvent::Shutdown)
    })
    .await;
    assert!(has(&events, |e| matches!(e, ScannerEvent::Fault(_))));
    assert!(!has(&events, |e| matches!(e, ScannerEvent::Ready)));
    assert_eq!(rig.control.state(), ScannerState::PowerDown);
    assert!(rig.rails.all_low());
}

#[tokio::test(start_paused = true)]
async fn test_power_saving_and_resume() {
    let mut rig = ready_rig().await;
    sleep(Duration::from_secs(599)).await;
    assert_eq!(rig.control.state(), ScannerState::Ready);

    wait_for_event(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, ScannerEvent::Shutdown)
    })
    .await;
    assert_eq!(rig.control.state(), ScannerState::PowerSaving);
    assert!(rig.rails.level(Rail::Power));

    // Fires once; dozing is not re-announced
    sleep(Duration::from_secs(1_800)).await;
    assert!(!has(&drain(&mut rig.events), |e| matches!(e, ScannerEvent::Shutdown)));

    let started = Instant::now();
    rig.control.startup();
    assert_eq!(rig.control.state(), ScannerState::StartingUp);
    sleep(Duration::from_millis(50)).await;
    assert!(rig.rails.level(Rail::Button));

    wait_for_event(&mut rig.events, Duration::from_secs(5), |e| {
        matches!(e, ScannerEvent::Ready)
    })
    .await;
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(4) && elapsed < Duration::from_millis(4_100),
        "{elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_scan_restarts_power_saving_countdown() {
    let mut rig = ready_rig().await;
    rig.transport
        .respond_to("SSP", vec![Reply::Data(ssp_ack())])
        .respond_to("XSC", vec![Reply::Data(status_packet(StatusDetail::Finished))]);

    sleep(Duration::from_secs(500)).await;
    rig.control.scan(false).unwrap();
    wait_for_event(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, ScannerEvent::NoPaper)
    })
    .await;

    sleep(Duration::from_secs(300)).await;
    assert_eq!(rig.control.state(), ScannerState::Ready);
    sleep(Duration::from_secs(301)).await;
    assert_eq!(rig.control.state(), ScannerState::PowerSaving);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_and_end() {
    let mut rig = ready_rig().await;
    rig.control.shutdown();
    assert_eq!(rig.control.state(), ScannerState::PowerDown);
    assert!(rig.rails.all_low());
    let events = drain(&mut rig.events);
    assert!(has(&events, |e| matches!(e, ScannerEvent::Shutdown)));

    // A second shutdown stays quiet
    rig.control.shutdown();
    assert!(drain(&mut rig.events).is_empty());

    rig.control.end().await;
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_scan_stays_powered_down() {
    let mut rig = ready_rig().await;
    rig.transport
        .respond_to("SSP", vec![Reply::Data(ssp_ack())])
        .respond_to("ABT", vec![Reply::Data(status_packet(StatusDetail::Aborted))]);
    rig.control.scan(false).unwrap();
    sleep(Duration::from_secs(1)).await;

    rig.control.scan_stop();
    rig.control.abort_scan();
    rig.control.shutdown();
    let powered_off = rig.rails.log().len();
    drain(&mut rig.events);

    // Past the motor wake-up, the paper deadline and the jam watchdog
    sleep(Duration::from_secs(20)).await;
    assert_eq!(rig.control.state(), ScannerState::PowerDown);
    assert!(!rig.control.can_scan());
    assert!(rig.rails.all_low());
    assert!(rig.rails.log()[powered_off..].iter().all(|&(_, on)| !on));
    assert!(drain(&mut rig.events).is_empty());
    assert!(matches!(rig.control.scan(false), Err(ScanError::NotReady(ScannerState::PowerDown))));
}

#[tokio::test(start_paused = true)]
async fn test_transport_loss_after_shutdown_is_not_a_fault() {
    let mut rig = ready_rig().await;
    let mut replies = vec![Reply::Timeout; 50];
    replies.push(Reply::Fail);
    rig.transport
        .respond_to("SSP", vec![Reply::Data(ssp_ack())])
        .respond_to("XSC", replies);
    rig.control.scan(false).unwrap();
    sleep(Duration::from_secs(3)).await;
    assert!(rig.rails.level(Rail::MotorWake));

    rig.control.shutdown();
    drain(&mut rig.events);
    sleep(Duration::from_secs(20)).await;
    assert!(drain(&mut rig.events).is_empty());
    assert_eq!(rig.control.state(), ScannerState::PowerDown);
    assert!(rig.rails.all_low());
    assert_eq!(rig.transport.remaining(), 0);

    // The handle was closed, so a fresh power-on reconnects and works
    rig.control.startup();
    wait_for_event(&mut rig.events, Duration::from_secs(8), |e| {
        matches!(e, ScannerEvent::Ready)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_startup() {
    let mut rig = rig();
    rig.control.startup();
    sleep(Duration::from_secs(3)).await;
    rig.control.shutdown();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(rig.control.state(), ScannerState::PowerDown);
    assert!(!has(&drain(&mut rig.events), |e| matches!(e, ScannerEvent::Ready)));
    rig.control.end().await;
}
