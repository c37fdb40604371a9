//! # Subscriber Demo
//!
//! Drives the DataShare client against the in-process loopback service:
//! subscribes in all three domains, pushes changes, simulates a service death
//! and checks that the subscriptions come back.

use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_datashare::loggers::setup_logging;
use lib_datashare::{
    ChangeType, DataShareConfig, DataShareHelper, DataShareManager, LoopbackConnector, LoopbackService,
    ProxyDataChangeInfo, ProxyValue, PublishedData, PublishedDataItem, PublishedValue, RdbChangeNode, TemplateId,
    load_config,
};
use log::{info, warn};
use std::sync::Arc;

fn main() -> Result<()> {
    // 1. Command line wins over file and environment
    let cli = DataShareConfig::parse();
    let config = load_config(cli.config_path.as_deref()).merge(cli);

    let log_dir = config.log_dir.clone().unwrap_or_else(|| "./logs".into());
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    let log_path = setup_logging(&log_dir, &log_level).context("Failed to initialize logging")?;
    info!("Logging to {}", log_path.display());

    // 2. Wire the manager to the loopback service
    let service = Arc::new(LoopbackService::new());
    let connector = Arc::new(LoopbackConnector::new(Arc::clone(&service)));
    let manager = DataShareManager::new(connector, config.reconnect_policy());
    let bundle_name = config.bundle_name.clone().unwrap_or_default();

    let helper = DataShareHelper::new(Arc::clone(&manager));
    let template_id = TemplateId::new(1, bundle_name.clone());

    // 3. Subscribe in every domain
    let results = helper.subscribe_rdb_data(&["datashare:///notes"], &template_id, |node| {
        info!("[rdb] {} rows for {}", node.data.len(), node.uri);
    });
    report("subscribe rdb", &results)?;
    let results = helper.subscribe_published_data(&["datashare:///weather"], 1, |node| {
        info!("[published] {} item(s) from {}", node.datas.len(), node.owner_bundle_name);
    });
    report("subscribe published", &results)?;
    let results = helper.subscribe_proxy_data(&["datashareproxy://demo/counter"], |changes| {
        for change in changes {
            info!("[proxy] {:?} {} = {:?}", change.change_type, change.uri, change.value);
        }
    });
    report("subscribe proxy", &results)?;

    // 4. Push one change per domain
    push_round(&service, &helper, &template_id, &bundle_name, 1);

    // 5. Service death and recovery
    warn!("Killing the loopback service");
    service.kill();
    manager.on_remote_died();
    service.revive();
    manager.wait_for_recovery();
    if manager.get_service().is_none() {
        bail!("Service did not come back after recovery");
    }
    push_round(&service, &helper, &template_id, &bundle_name, 2);

    helper.release();
    info!(
        "Done. Remaining enabled subscribers: rdb={}, published={}, proxy={}",
        manager.rdb_subscriber_manager().enabled_subscriber_size(),
        manager.published_data_subscriber_manager().enabled_subscriber_size(),
        manager.proxy_data_subscriber_manager().enabled_subscriber_size()
    );
    Ok(())
}

fn report(action: &str, results: &[lib_datashare::OperationResult]) -> Result<()> {
    if results.is_empty() {
        bail!("{}: no service", action);
    }
    for result in results {
        info!("{} {} -> {}", action, result.key, result.err_code);
    }
    Ok(())
}

fn push_round(
    service: &LoopbackService,
    helper: &DataShareHelper,
    template_id: &TemplateId,
    bundle_name: &str,
    version: i32,
) {
    let reached = service.push_rdb_change(&RdbChangeNode {
        uri: "datashare:///notes".to_string(),
        template_id: template_id.clone(),
        data: vec![r#"{"title":"hello"}"#.to_string()],
    });
    info!("rdb change reached {} stub(s)", reached);

    let data = PublishedData {
        datas: vec![PublishedDataItem::new(
            "datashare:///weather",
            1,
            PublishedValue::Text("sunny".to_string()),
        )],
        version,
    };
    for result in helper.publish(&data, bundle_name) {
        info!("publish {} -> {}", result.key, result.err_code);
    }

    service.push_proxy_change(&[ProxyDataChangeInfo {
        change_type: ChangeType::Update,
        uri: "datashareproxy://demo/counter".to_string(),
        value: ProxyValue::Int(chrono::Local::now().timestamp()),
    }]);
}
