//! End-to-end pairing flow and the events it produces.

use std::sync::{Arc, Mutex};

use hwsim_core::events::{DeviceEvent, PairingEndReason};
use hwsim_core::harness::TestClient;
use hwsim_core::state::SessionPhase;
use hwsim_core::{DeviceConfig, DeviceRegistry};

#[tokio::test]
async fn test_pairing_flow_events() {
    let reg = DeviceRegistry::new(DeviceConfig::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = reg.subscribe("wallet-1", move |e| sink.lock().unwrap().push(e.clone()));

    let dev = reg.device("wallet-1");
    let mut client = TestClient::new(dev.clone()).with_app_name("flow-test");
    let resp = client.connect().await.unwrap();
    assert!(!resp.paired);
    assert_eq!(resp.firmware_version, vec![0, 15, 0]);

    let code = dev.enter_pairing_mode().await.unwrap();
    assert_eq!(code.len(), 8);
    assert_eq!(dev.status().await.phase, SessionPhase::PairingMode);

    let wallets = client.pair(&code).await.unwrap().wallets;
    assert_eq!(wallets.len(), 1);
    assert!(!wallets[0].external);
    assert_eq!(dev.status().await.phase, SessionPhase::Paired);
    assert_eq!(dev.pairings().await.unwrap()[0].app_name, "flow-test");

    dev.heartbeat();
    sub.unsubscribe();
    dev.heartbeat();

    let events = seen.lock().unwrap().clone();
    assert!(matches!(events[0], DeviceEvent::Connected { paired: false }));
    assert!(matches!(events[1], DeviceEvent::PairingStarted { .. }));
    assert_eq!(events[2], DeviceEvent::PairingEnded { reason: PairingEndReason::Paired });
    assert_eq!(events[3], DeviceEvent::Paired { app_name: "flow-test".into() });
    assert!(matches!(events[4], DeviceEvent::Heartbeat { .. }));
    assert_eq!(events.len(), 5);
}

#[tokio::test]
async fn test_connect_during_pairing_supersedes_window() {
    let reg = DeviceRegistry::new(DeviceConfig::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = reg.subscribe("wallet-1", move |e| sink.lock().unwrap().push(e.clone()));

    let dev = reg.device("wallet-1");
    let mut client = TestClient::new(dev.clone());
    client.connect().await.unwrap();
    let code = dev.enter_pairing_mode().await.unwrap();

    client.connect().await.unwrap();
    assert!(dev.status().await.pairing_code.is_none());
    assert!(seen
        .lock()
        .unwrap()
        .contains(&DeviceEvent::PairingEnded { reason: PairingEndReason::Superseded }));
    assert!(client.pair(&code).await.is_err());
}
