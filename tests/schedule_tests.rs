mod common;

use std::sync::Arc;

use common::{FixedClock, command_path, feature_path, identity, request_client, seed_valid_token};
use serde_json::json;
use vicare_bridge::{Error, MemoryStore, ScheduleEngine, ScheduleKind, StateStore, Weekday, keys};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DHW: &str = "heating.dhw.schedule";

fn engine(server: &MockServer) -> (ScheduleEngine, Arc<MemoryStore>) {
    let clock = FixedClock::monday_ten();
    let store = Arc::new(MemoryStore::new());
    seed_valid_token(&store, clock.as_ref());
    let client = request_client(server, store.clone(), clock);
    (ScheduleEngine::new(client, store.clone()), store)
}

#[tokio::test]
async fn write_posts_normalized_and_trimmed_schedule() {
    let server = MockServer::start().await;
    let expected = json!({"newSchedule": {
        "mon": [
            {"start": "05:00", "end": "06:00", "mode": "on", "position": 0},
            {"start": "07:00", "end": "08:00", "mode": "on", "position": 1},
            {"start": "09:00", "end": "10:00", "mode": "off", "position": 2},
            {"start": "11:00", "end": "12:00", "mode": "on", "position": 3}
        ],
        "tue": [], "wed": [], "thu": [], "fri": [], "sat": [], "sun": []
    }});
    Mock::given(method("POST"))
        .and(path(command_path("0", DHW, "setSchedule")))
        .and(body_json(expected))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"success": true}})))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = engine(&server);
    let proposed = r#"{"mon": [
        {"start": "13:00", "end": "14:00", "mode": "on"},
        {"start": "11:00", "end": "12:00", "mode": "on"},
        {"start": "09:00:00", "end": "10:00:00", "mode": "eco"},
        {"start": "07:00", "end": "08:00", "mode": "on"},
        {"start": "05:00", "end": "06:00", "mode": "on"},
        {"start": "22:00", "end": "21:00", "mode": "on"}
    ]}"#;
    let written = engine
        .write_schedule(ScheduleKind::HotWater, &identity(), proposed)
        .await
        .unwrap();

    assert_eq!(written.day(Weekday::Mon).len(), 4);
    assert_eq!(
        store.get_str(&keys::entries(ScheduleKind::HotWater)).unwrap(),
        serde_json::to_string(&written).unwrap()
    );
    assert_eq!(store.get_bool(&keys::active(ScheduleKind::HotWater)), Some(true));
}

#[tokio::test]
async fn failed_write_leaves_mirror_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(command_path("0", DHW, "setSchedule")))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = engine(&server);
    store.set(&keys::entries(ScheduleKind::HotWater), json!("original")).unwrap();
    store.set(&keys::active(ScheduleKind::HotWater), json!(false)).unwrap();

    let err = engine
        .write_schedule(ScheduleKind::HotWater, &identity(), r#"{"mon": []}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HttpStatus { status: 502, .. }), "{err:?}");
    assert_eq!(
        store.get_str(&keys::entries(ScheduleKind::HotWater)).as_deref(),
        Some("original")
    );
    assert_eq!(store.get_bool(&keys::active(ScheduleKind::HotWater)), Some(false));
    assert!(
        store
            .get_str(keys::LAST_STATUS)
            .unwrap()
            .ends_with("-> 502")
    );
}

#[tokio::test]
async fn invalid_json_makes_no_request() {
    let server = MockServer::start().await;
    let (engine, _store) = engine(&server);

    for raw in ["", "[]", "{not json"] {
        let err = engine
            .write_schedule(ScheduleKind::Heating, &identity(), raw)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidScheduleJson(_)), "{raw}: {err:?}");
    }
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn per_kind_cap_is_configurable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(command_path("0", DHW, "setSchedule")))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (engine, _store) = engine(&server);
    let engine = engine.with_max_entries(ScheduleKind::HotWater, 2);
    let written = engine
        .write_schedule(
            ScheduleKind::HotWater,
            &identity(),
            r#"{"sat": [
                {"start": "08:00", "end": "09:00", "mode": "on"},
                {"start": "06:00", "end": "07:00", "mode": "on"},
                {"start": "10:00", "end": "11:00", "mode": "on"}
            ]}"#,
        )
        .await
        .unwrap();
    let starts: Vec<&str> = written.day(Weekday::Sat).iter().map(|s| s.start.as_str()).collect();
    assert_eq!(starts, vec!["06:00", "08:00"]);
    assert_eq!(engine.max_entries(ScheduleKind::Heating), 4);
}

#[tokio::test]
async fn reset_posts_empty_body_and_keeps_mirror() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(command_path("0", "heating.circuits.0.heating.schedule", "resetSchedule")))
        .and(body_json(json!({})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = engine(&server);
    store.set(&keys::entries(ScheduleKind::Heating), json!("before")).unwrap();
    engine.reset_schedule(ScheduleKind::Heating, &identity()).await.unwrap();
    assert_eq!(
        store.get_str(&keys::entries(ScheduleKind::Heating)).as_deref(),
        Some("before")
    );
}

#[tokio::test]
async fn read_mirrors_entries_and_active() {
    let server = MockServer::start().await;
    let entries = json!({"mon": [{"start": "06:00", "end": "22:00", "mode": "on", "position": 0}]});
    Mock::given(method("GET"))
        .and(path(feature_path("0", "heating.dhw.pumps.circulation.schedule")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "feature": "heating.dhw.pumps.circulation.schedule",
            "properties": {
                "active": {"type": "boolean", "value": true},
                "entries": {"type": "Schedule", "value": entries}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = engine(&server);
    let read = engine
        .read_schedule(ScheduleKind::Circulation, &identity())
        .await
        .unwrap();
    assert_eq!(read, entries);
    let mirrored: serde_json::Value =
        serde_json::from_str(&store.get_str(&keys::entries(ScheduleKind::Circulation)).unwrap()).unwrap();
    assert_eq!(mirrored, entries);
    assert_eq!(store.get_bool(&keys::active(ScheduleKind::Circulation)), Some(true));
}
