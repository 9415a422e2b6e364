use std::time::Duration;

use sharded_counter::{Dispatcher, Number, ShardedCounter, Value};

mod support;

use support::{eventually, fast_config, field, shared_store};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn low_traffic_is_aggregated_inline() -> anyhow::Result<()> {
    support::init_tracing();
    let (store, dyn_store) = shared_store();
    let handle = Dispatcher::new(dyn_store.clone(), &fast_config()).spawn();

    let clients: Vec<_> = (0..3)
        .map(|_| ShardedCounter::new(dyn_store.clone(), "pages/home", "visits"))
        .collect();
    for round in 0..10 {
        for client in &clients {
            client.increment_by(1).await?;
        }
        if round % 3 == 0 {
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    }

    let converged = eventually(Duration::from_secs(10), || {
        let store = store.clone();
        async move { Ok(field(store.as_ref(), "pages/home", "visits").await? == Some(Value::Integer(30))) }
    })
    .await?;
    handle.shutdown().await?;

    assert!(converged, "counter did not reach 30");
    assert_eq!(clients[0].get().await?, Number::Integer(30));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heavy_traffic_is_handed_to_workers() -> anyhow::Result<()> {
    support::init_tracing();
    let (store, dyn_store) = shared_store();
    let mut config = fast_config();
    config.controller.inline_aggregation_limit = 10;

    let clients: Vec<_> = (0..40)
        .map(|_| ShardedCounter::new(dyn_store.clone(), "pages/home", "stats.hits"))
        .collect();
    for _ in 0..5 {
        for client in &clients {
            client.increment_by(1).await?;
        }
    }

    let handle = Dispatcher::new(dyn_store.clone(), &config).spawn();
    let converged = eventually(Duration::from_secs(20), || {
        let store = store.clone();
        async move {
            Ok(field(store.as_ref(), "pages/home", "stats.hits").await? == Some(Value::Integer(200)))
        }
    })
    .await?;
    handle.shutdown().await?;

    assert!(converged, "counter did not reach 200");
    for client in clients.iter().take(3) {
        assert_eq!(client.get().await?, Number::Integer(200));
    }
    Ok(())
}
