mod common;

use common::*;
use scanberry_lib::emulate::{EmulatedConnector, EmulatedTransport};
use scanberry_lib::gpio::LoggingRails;
use scanberry_lib::params::{Source, SspRequest, XscRequest};

fn connector() -> EmulatedConnector {
    EmulatedConnector {
        feed_time: Duration::from_secs(2),
        chunk_size: 1024,
    }
}

#[tokio::test(start_paused = true)]
async fn test_emulated_acks() {
    let driver = ProtocolDriver::new(EmulatedTransport::new(Duration::ZERO, 1024));
    driver.set_parameters(&SspRequest::new(150)).await.unwrap();
    driver.set_source(Source::Adf).await.unwrap();
    driver.set_source_d(Source::Adf).await.unwrap();
    driver.abort(false).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_emulated_rejects_unknown_command() {
    let transport = EmulatedTransport::new(Duration::ZERO, 1024);
    let result = transport.write(b"\x1bQQQ\n\n\x80", Duration::from_secs(1)).await;
    assert!(matches!(result, Err(ScanError::Protocol(_))));
    let result = transport.write(b"SSP\n\n\x80", Duration::from_secs(1)).await;
    assert!(matches!(result, Err(ScanError::Protocol(_))));
}

#[tokio::test(start_paused = true)]
async fn test_emulated_page_follows_requested_area() {
    let mut driver = ProtocolDriver::new(connector().connect().unwrap());
    let page = driver
        .scan(&XscRequest::new(150, [10, 20, 110, 100]))
        .await
        .unwrap()
        .last_page()
        .await
        .unwrap()
        .expect("emulated page");
    assert_eq!((page.width(), page.height()), (100, 80));
}

#[tokio::test(start_paused = true)]
async fn test_emulated_abort_during_feed() {
    let mut driver = ProtocolDriver::new(connector().connect().unwrap());
    let abort = driver.abort_handle();
    let mut session = driver.scan(&XscRequest::new(150, [0, 0, 64, 48])).await.unwrap();
    abort.request();
    assert!(session.next_page().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_emulated_end_to_end_scan() {
    init_tracing();
    let (control, mut events) = ScannerControl::new(LoggingRails, connector(), test_config());
    control.startup();
    wait_for_event(&mut events, Duration::from_secs(8), |e| matches!(e, ScannerEvent::Ready)).await;

    control.scan(false).unwrap();
    let events = wait_for_event(&mut events, Duration::from_secs(4), |e| {
        matches!(e, ScannerEvent::ScanSuccess(_))
    })
    .await;
    let Some(ScannerEvent::ScanSuccess(page)) = events.last() else {
        panic!("expected a page, got {events:?}");
    };
    assert_eq!((page.width(), page.height()), (64, 48));
    assert!(control.can_scan());

    control.shutdown();
    control.end().await;
    assert_eq!(control.state(), ScannerState::PowerDown);
}
