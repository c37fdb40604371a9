use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_datashare::proxy::loopback::RemoteOp;
use lib_datashare::{
    ChangeType, DataShareHelper, DataShareManager, LoopbackConnector, LoopbackService, ProxyDataChangeInfo, ProxyValue,
    PublishedData, PublishedDataItem, PublishedValue, RdbChangeNode, ReconnectPolicy, TemplateId,
};

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        delay: Duration::from_millis(5),
        max_attempts: 100,
    }
}

fn setup() -> (Arc<LoopbackService>, Arc<LoopbackConnector>, Arc<DataShareManager>) {
    let service = Arc::new(LoopbackService::new());
    let connector = Arc::new(LoopbackConnector::new(Arc::clone(&service)));
    let manager = DataShareManager::new(connector.clone(), fast_policy());
    (service, connector, manager)
}

#[test]
fn recovery_restores_every_domain_with_enabled_state() {
    let (service, _, manager) = setup();
    let helper = DataShareHelper::new(Arc::clone(&manager));
    let template_id = TemplateId::new(7, "com.example.notes");

    helper.subscribe_rdb_data(&["r://on", "r://off"], &template_id, |_| {});
    helper.disable_rdb_subs(&["r://off"], &template_id);
    helper.subscribe_published_data(&["p://key"], 3, |_| {});
    helper.subscribe_proxy_data(&["d://key"], |_| {});
    helper.disable_proxy_subs(&["d://key"]);

    service.kill();
    manager.on_remote_died();
    service.revive();
    manager.wait_for_recovery();

    assert_eq!(service.rdb_registration("r://on", &template_id), Some(true));
    assert_eq!(service.rdb_registration("r://off", &template_id), Some(false));
    assert_eq!(service.published_registration("p://key", 3), Some(true));
    assert_eq!(service.proxy_registration("d://key"), Some(false));
}

#[test]
fn callbacks_flow_again_after_recovery() {
    let (service, _, manager) = setup();
    let helper = DataShareHelper::new(Arc::clone(&manager));
    let template_id = TemplateId::new(7, "com.example.notes");
    let rdb_hits = Arc::new(AtomicUsize::new(0));
    let proxy_values = Arc::new(Mutex::new(Vec::new()));

    let hits = Arc::clone(&rdb_hits);
    helper.subscribe_rdb_data(&["r://a"], &template_id, move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    let values = Arc::clone(&proxy_values);
    helper.subscribe_proxy_data(&["d://a"], move |changes: &[ProxyDataChangeInfo]| {
        values.lock().unwrap().extend(changes.iter().map(|c| c.value.clone()));
    });

    service.kill();
    manager.on_remote_died();
    service.revive();
    manager.wait_for_recovery();

    service.push_rdb_change(&RdbChangeNode {
        uri: "r://a".to_string(),
        template_id: template_id.clone(),
        data: vec!["{}".to_string()],
    });
    service.push_proxy_change(&[ProxyDataChangeInfo {
        change_type: ChangeType::Update,
        uri: "d://a".to_string(),
        value: ProxyValue::Int(9),
    }]);

    assert_eq!(rdb_hits.load(Ordering::SeqCst), 1);
    assert_eq!(*proxy_values.lock().unwrap(), vec![ProxyValue::Int(9)]);
}

#[test]
fn published_subscription_survives_and_receives_publish() {
    let (service, _, manager) = setup();
    let consumer = DataShareHelper::new(Arc::clone(&manager));
    let producer = DataShareHelper::new(Arc::clone(&manager));
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    consumer.subscribe_published_data(&["p://weather"], 11, move |node| {
        sink.lock().unwrap().push(node.owner_bundle_name.clone());
    });

    service.kill();
    manager.on_remote_died();
    service.revive();
    manager.wait_for_recovery();

    let data = PublishedData {
        datas: vec![PublishedDataItem::new("p://weather", 11, PublishedValue::Text("sunny".to_string()))],
        version: 2,
    };
    producer.publish(&data, "com.example.weather");

    assert_eq!(*received.lock().unwrap(), vec!["com.example.weather".to_string()]);
}

#[test]
fn repeated_death_reports_run_a_single_recovery() {
    let service = Arc::new(LoopbackService::new());
    let connector = Arc::new(LoopbackConnector::new(Arc::clone(&service)));
    let slow_policy = ReconnectPolicy {
        delay: Duration::from_millis(200),
        max_attempts: 3,
    };
    let manager = DataShareManager::new(connector.clone(), slow_policy);
    let helper = DataShareHelper::new(Arc::clone(&manager));
    helper.subscribe_proxy_data(&["d://a"], |_| {});
    let connects_before = connector.attempts();
    service.clear_calls();

    // Registrations are lost but the service is back before the first retry.
    service.kill();
    service.revive();
    for _ in 0..5 {
        manager.on_remote_died();
    }
    manager.wait_for_recovery();

    assert_eq!(connector.attempts() - connects_before, 1);
    assert_eq!(service.count(RemoteOp::SubscribeProxy, "d://a"), 1);
}
