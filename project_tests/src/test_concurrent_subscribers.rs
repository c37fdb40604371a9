//! # Concurrent Subscribers Soak Test
//!
//! Spawns many helpers on one manager and lets them subscribe, toggle and
//! unsubscribe the same keys from several threads while the loopback service
//! pushes changes. An anchor helper holds every key for the whole run, so the
//! service must see exactly one subscribe per key and nothing else. Once the
//! anchor is released every table must be empty and the service must hold no
//! registrations.

use anyhow::{Result, bail};
use clap::Parser;
use lib_datashare::loggers::setup_logging;
use lib_datashare::{
    DataShareHelper, DataShareManager, LoopbackConnector, LoopbackService, RdbChangeNode, ReconnectPolicy, TemplateId,
};
use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(about = "Concurrent DataShare subscriber soak test")]
struct Args {
    /// Number of helper threads.
    #[clap(long, default_value_t = 8)]
    threads: usize,

    /// Subscribe/toggle/unsubscribe rounds per thread.
    #[clap(long, default_value_t = 500)]
    rounds: usize,

    /// Number of distinct keys shared by all threads.
    #[clap(long, default_value_t = 4)]
    keys: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // // Statement: Log into a throwaway directory so runs leave nothing behind
    let log_dir = tempfile::tempdir()?;
    setup_logging(log_dir.path(), "warn")?;

    let service = Arc::new(LoopbackService::new());
    let connector = Arc::new(LoopbackConnector::new(Arc::clone(&service)));
    let policy = ReconnectPolicy {
        delay: Duration::from_millis(10),
        max_attempts: 5,
    };
    let manager = DataShareManager::new(connector, policy);
    let template_id = TemplateId::new(1, "com.example.soak");
    let uris: Vec<String> = (0..args.keys).map(|i| format!("datashare:///soak/{}", i)).collect();
    let delivered = Arc::new(AtomicUsize::new(0));

    // // Statement: The anchor keeps every key registered while workers churn
    let anchor = DataShareHelper::new(Arc::clone(&manager));
    let anchored = anchor.subscribe_rdb_data(&uris, &template_id, |_: &RdbChangeNode| {});
    if anchored.iter().any(|result| !result.err_code.is_ok()) {
        bail!("Anchor subscription failed: {:?}", anchored);
    }
    service.clear_calls();

    println!(
        "[*] {} threads x {} rounds over {} keys started at {}",
        args.threads,
        args.rounds,
        args.keys,
        chrono::Local::now().format("%H:%M:%S")
    );
    let started = Instant::now();

    // // Statement: Every worker owns one helper and churns its subscriptions
    let workers: Vec<_> = (0..args.threads)
        .map(|worker| {
            let manager = Arc::clone(&manager);
            let uris = uris.clone();
            let template_id = template_id.clone();
            let delivered = Arc::clone(&delivered);
            thread::spawn(move || {
                let helper = DataShareHelper::new(manager);
                for round in 0..args.rounds {
                    let uri = &uris[(worker + round) % uris.len()];
                    let counter = Arc::clone(&delivered);
                    helper.subscribe_rdb_data(&[uri.as_str()], &template_id, move |_: &RdbChangeNode| {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                    helper.disable_rdb_subs(&[uri.as_str()], &template_id);
                    helper.enable_rdb_subs(&[uri.as_str()], &template_id);
                    helper.unsubscribe_rdb_data(&[uri.as_str()], &template_id);
                }
            })
        })
        .collect();

    // // Statement: Push changes while the workers run
    let mut pushes = 0usize;
    while workers.iter().any(|w| !w.is_finished()) {
        for uri in &uris {
            service.push_rdb_change(&RdbChangeNode {
                uri: uri.clone(),
                template_id: template_id.clone(),
                data: vec!["{}".to_string()],
            });
            pushes += 1;
        }
        thread::sleep(Duration::from_millis(1));
    }
    for worker in workers {
        if worker.join().is_err() {
            bail!("A worker thread panicked");
        }
    }

    println!(
        "[INFO] {:?} elapsed, {} pushes, {} callbacks delivered",
        started.elapsed(),
        pushes,
        delivered.load(Ordering::Relaxed)
    );

    // // Statement: Churn stayed local; the anchor kept every key alive
    let remote_calls = service.calls();
    if !remote_calls.is_empty() {
        bail!("{} remote call(s) leaked while the anchor held every key", remote_calls.len());
    }
    let anchored_size = manager.rdb_subscriber_manager().enabled_subscriber_size();
    if anchored_size != uris.len() {
        bail!("Expected {} anchored key(s), found {}", uris.len(), anchored_size);
    }

    // // Statement: Nothing may be left behind locally or remotely
    drop(anchor);
    let remaining = manager.rdb_subscriber_manager().enabled_subscriber_size();
    let registered: Vec<&String> = uris
        .iter()
        .filter(|uri| service.rdb_registration(uri, &template_id).is_some())
        .collect();
    info!("remaining={} registered={:?}", remaining, registered);
    if remaining != 0 {
        bail!("{} enabled subscriber(s) left in the RDB table", remaining);
    }
    if !registered.is_empty() {
        bail!("Registrations left on the service: {:?}", registered);
    }
    if manager.rdb_subscriber_manager().has_service_callback() {
        bail!("Service callback still attached after every subscriber left");
    }

    println!("[SUCCESS] Concurrent subscriber soak passed");
    Ok(())
}
