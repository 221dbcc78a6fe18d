mod support;

use core::cell::Cell;

use support::{FakeModem, VirtualClock};
use telematics_core::cache::{EvictionPolicy, TelemetryCache};
use telematics_core::config::{HttpMethod, HttpTarget, LinkConfig, UplinkConfig};
use telematics_core::modem::{JoinFailure, LinkState, SessionPhase};
use telematics_core::uplink::{LinkFault, Recovery, Uplink, UplinkEvent, UplinkPhase};

const TICK_MS: u32 = 100;

type TestUplink<'a> = Uplink<FakeModem<'a>, VirtualClock<'a>>;

fn config() -> UplinkConfig {
    let link = LinkConfig::new("garage", "secret", "hub.local", 8080).expect("config should build");
    UplinkConfig::new(link).with_drain_interval(0)
}

fn uplink<'a>(now: &'a Cell<u32>, modem: FakeModem<'a>, config: UplinkConfig) -> TestUplink<'a> {
    Uplink::new(modem, VirtualClock { now }, config)
}

/// Polls until `stop` accepts an event, advancing the clock between polls.
fn run_until<const N: usize>(
    uplink: &mut TestUplink<'_>,
    cache: &mut TelemetryCache<N>,
    now: &Cell<u32>,
    mut stop: impl FnMut(&UplinkEvent) -> bool,
) -> Vec<UplinkEvent> {
    let mut events = Vec::new();
    for _ in 0..500 {
        let event = uplink.poll(cache);
        let done = stop(&event);
        events.push(event);
        if done {
            return events;
        }
        now.set(now.get() + TICK_MS);
    }
    panic!("uplink never reached the expected event: {events:?}");
}

fn connected(uplink: &mut TestUplink<'_>, cache: &mut TelemetryCache<384>, now: &Cell<u32>) {
    run_until(uplink, cache, now, |event| *event == UplinkEvent::Connected);
    assert_eq!(uplink.phase(), UplinkPhase::Idle);
}

#[test]
fn brings_link_up_and_delivers_cache() {
    let now = Cell::new(0);
    let mut uplink = uplink(&now, FakeModem::new(&now), config());
    let mut cache = TelemetryCache::<384>::default();

    let events = run_until(&mut uplink, &mut cache, &now, |event| {
        *event == UplinkEvent::Connected
    });
    assert_eq!(events[0], UplinkEvent::ModemReady);
    assert!(matches!(&events[1], UplinkEvent::Joined(address) if address.as_str() == "192.168.4.2"));
    assert_eq!(events[2], UplinkEvent::Connecting);

    cache.dispatch("C=1500", 1_000).unwrap();
    cache.dispatch("D=60", 1_500).unwrap();

    let events = run_until(&mut uplink, &mut cache, &now, |event| {
        matches!(event, UplinkEvent::Delivered { .. })
    });

    assert_eq!(events[0], UplinkEvent::Draining { bytes: 22 });
    assert_eq!(events.last(), Some(&UplinkEvent::Delivered { bytes: 22 }));
    assert!(cache.is_empty());
    let modem = uplink.link().channel().transport();
    assert_eq!(modem.payloads, vec![b"#1000,C=1500 500,D=60 ".to_vec()]);
    assert!(modem.saw("AT+CIPSEND=22"));
}

#[test]
fn three_session_timeouts_trigger_rejoin_instead_of_resend() {
    let now = Cell::new(0);
    let mut modem = FakeModem::new(&now);
    modem.drop_acks = u32::MAX;
    let mut uplink = uplink(&now, modem, config());
    let mut cache = TelemetryCache::<384>::default();
    connected(&mut uplink, &mut cache, &now);

    cache.dispatch("C=1500", 1_000).unwrap();

    let mut recoveries = Vec::new();
    while recoveries.len() < 3 {
        let events = run_until(&mut uplink, &mut cache, &now, |event| {
            matches!(event, UplinkEvent::Fault { .. })
        });
        match events.last() {
            Some(UplinkEvent::Fault { fault, recovery }) => {
                assert_eq!(*fault, LinkFault::SessionTimeout(SessionPhase::Send));
                recoveries.push(*recovery);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(
        recoveries,
        vec![Recovery::Retry, Recovery::Retry, Recovery::Reconnect]
    );
    assert_eq!(uplink.phase(), UplinkPhase::Join);
    assert_eq!(uplink.link().state(), LinkState::Disconnected);
    assert!(uplink.link().channel().transport().saw("AT+CWQAP"));

    let next = uplink.poll(&mut cache);
    assert!(matches!(next, UplinkEvent::Joined(_)), "got {next:?}");
    assert_eq!(uplink.poll(&mut cache), UplinkEvent::Connecting);

    // Nothing was acknowledged, so the record is still cached.
    assert_eq!(cache.as_str(), "#1000,C=1500 ");
    assert!(!cache.is_draining());
}

#[test]
fn repeated_connect_failures_escalate_to_modem_reset() {
    let now = Cell::new(0);
    let mut modem = FakeModem::new(&now);
    modem.refuse_connect = true;
    let mut uplink = uplink(&now, modem, config());
    let mut cache = TelemetryCache::<384>::default();

    let mut recoveries = Vec::new();
    run_until(&mut uplink, &mut cache, &now, |event| match event {
        UplinkEvent::Fault { recovery, .. } => {
            recoveries.push(*recovery);
            *recovery == Recovery::Reset
        }
        _ => false,
    });

    assert_eq!(
        recoveries,
        vec![
            Recovery::Retry,
            Recovery::Retry,
            Recovery::Reconnect,
            Recovery::Reconnect,
            Recovery::Reconnect,
            Recovery::Reset,
        ]
    );
    assert_eq!(uplink.phase(), UplinkPhase::Init);
    assert!(uplink.link().channel().transport().saw("AT+RST"));

    assert_eq!(uplink.poll(&mut cache), UplinkEvent::ModemReady);
}

#[test]
fn rejected_join_backs_off_before_retrying() {
    let now = Cell::new(0);
    let mut modem = FakeModem::new(&now);
    modem.reject_join = true;
    let mut uplink = uplink(&now, modem, config().with_backoff(5_000, 10_000));
    let mut cache = TelemetryCache::<384>::default();

    assert_eq!(uplink.poll(&mut cache), UplinkEvent::ModemReady);
    let until_ms = match uplink.poll(&mut cache) {
        UplinkEvent::Fault {
            fault: LinkFault::AssociationFailed(JoinFailure::Refused),
            recovery: Recovery::Backoff { until_ms },
        } => until_ms,
        other => panic!("unexpected event {other:?}"),
    };

    now.set(until_ms - 1);
    assert_eq!(uplink.poll(&mut cache), UplinkEvent::Waiting);

    uplink.link_mut().channel_mut().transport_mut().reject_join = false;
    now.set(until_ms);
    assert!(matches!(uplink.poll(&mut cache), UplinkEvent::Joined(_)));
    assert_eq!(uplink.link().errors(), 0);
}

#[test]
fn silent_modem_reports_unresponsive_and_waits() {
    let now = Cell::new(0);
    let mut modem = FakeModem::new(&now);
    modem.silent = true;
    let mut uplink = uplink(&now, modem, config().with_backoff(5_000, 10_000));
    let mut cache = TelemetryCache::<384>::default();

    let event = uplink.poll(&mut cache);
    assert!(matches!(
        event,
        UplinkEvent::Fault {
            fault: LinkFault::ModemUnresponsive,
            recovery: Recovery::Backoff { .. },
        }
    ));
    assert_eq!(uplink.poll(&mut cache), UplinkEvent::Waiting);
    assert_eq!(uplink.phase(), UplinkPhase::Init);
}

#[test]
fn records_logged_during_drain_stay_for_the_next_one() {
    let now = Cell::new(0);
    let mut modem = FakeModem::new(&now);
    modem.latency_ms = 300;
    let mut uplink = uplink(&now, modem, config());
    let mut cache = TelemetryCache::<384>::default();
    connected(&mut uplink, &mut cache, &now);

    cache.dispatch("C=1500", 1_000).unwrap();
    let event = uplink.poll(&mut cache);
    assert_eq!(event, UplinkEvent::Draining { bytes: 13 });
    cache.dispatch("D=61", 1_100).unwrap();

    run_until(&mut uplink, &mut cache, &now, |event| {
        matches!(event, UplinkEvent::Delivered { bytes: 13 })
    });

    assert_eq!(cache.as_str(), "#1100,D=61 ");
}

#[test]
fn http_session_is_reopened_when_keep_alive_budget_is_spent() {
    let now = Cell::new(0);
    let link = LinkConfig::new("garage", "secret", "hub.local", 80)
        .expect("config should build")
        .with_keep_alive_budget(2);
    let target = HttpTarget::new(HttpMethod::Post, "/push").expect("path fits");
    let config = UplinkConfig::new(link)
        .with_drain_interval(0)
        .with_http(target);
    let mut uplink = uplink(&now, FakeModem::new(&now), config);
    let mut cache = TelemetryCache::<384>::default();
    connected(&mut uplink, &mut cache, &now);

    for (value, time) in [("C=1", 1_000), ("C=2", 2_000)] {
        cache.dispatch(value, time).unwrap();
        run_until(&mut uplink, &mut cache, &now, |event| {
            *event == UplinkEvent::ResponseReceived
        });
    }

    let modem = uplink.link().channel().transport();
    let first = String::from_utf8_lossy(&modem.payloads[0]).into_owned();
    let second = String::from_utf8_lossy(&modem.payloads[1]).into_owned();
    assert!(first.contains("Connection: keep-alive\r\n"));
    assert!(second.contains("Connection: close\r\n"));
    assert!(second.ends_with("\r\n\r\n#2000,C=2 "));
    assert_eq!(uplink.phase(), UplinkPhase::Open);

    assert_eq!(uplink.poll(&mut cache), UplinkEvent::Connecting);
}

#[test]
fn cache_with_drop_policy_is_left_untouched_while_link_is_down() {
    let now = Cell::new(0);
    let mut modem = FakeModem::new(&now);
    modem.reject_join = true;
    let mut uplink = uplink(&now, modem, config());
    let mut cache = TelemetryCache::<384>::new(EvictionPolicy::Drop);
    cache.dispatch("C=1", 10).unwrap();

    for _ in 0..5 {
        uplink.poll(&mut cache);
        now.set(now.get() + 10_000);
    }

    assert_eq!(cache.as_str(), "#10,C=1 ");
    assert!(!cache.is_draining());
}
