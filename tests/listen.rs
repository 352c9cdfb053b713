//! Socket-level tests: real listeners, the accept loop and its timeouts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use varlink_proto::{
    Client, Connector, Error, ListenConfig, Listener, Parameters, Server,
};

fn params(value: serde_json::Value) -> Parameters {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

fn counting_server() -> Arc<Server> {
    let mut server = Server::new();
    server.register_call("org.example.Echo", |parameters| async move {
        Ok(parameters)
    });
    server.register_more("org.example.Count", |parameters, sink| async move {
        let n = parameters["n"].as_u64().unwrap_or(0);
        for i in 1..=n {
            sink.emit(params(json!({"i": i})), i < n).await?;
        }
        Ok(())
    });
    Arc::new(server)
}

async fn exercise(address: &str) {
    let client = Client::new(Connector::new(address));

    let reply = client
        .call("org.example.Echo", params(json!({"msg": "over the wire"})))
        .await
        .unwrap();
    assert_eq!(reply["msg"], "over the wire");

    let mut stream = client
        .more("org.example.Count", params(json!({"n": 2})))
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap().unwrap()["i"], 1);
    assert_eq!(stream.next().await.unwrap().unwrap().unwrap()["i"], 2);
    assert!(stream.next().await.unwrap().is_none());

    client.disconnect().await;
}

#[tokio::test]
async fn tcp_end_to_end() {
    let listener = Listener::bind("tcp:127.0.0.1:0").await.unwrap();
    let address = listener.local_address().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let config = ListenConfig {
        stop: Some(Arc::clone(&stop)),
        ..ListenConfig::default()
    };
    let serve = tokio::spawn(counting_server().serve(listener, config));

    exercise(&address).await;

    stop.store(true, Ordering::SeqCst);
    serve.await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let address = format!("unix:{}", dir.path().join("sock").display());

    let listener = Listener::bind(&address).await.unwrap();
    assert_eq!(listener.local_address().unwrap(), address);

    let stop = Arc::new(AtomicBool::new(false));
    let config = ListenConfig {
        stop: Some(Arc::clone(&stop)),
        ..ListenConfig::default()
    };
    let serve = tokio::spawn(counting_server().serve(listener, config));

    exercise(&address).await;

    stop.store(true, Ordering::SeqCst);
    serve.await.unwrap().unwrap();
}

#[tokio::test]
async fn accept_loop_gives_up_after_the_idle_timeout() {
    let listener = Listener::bind("tcp:127.0.0.1:0").await.unwrap();
    let config = ListenConfig {
        idle_timeout: Duration::from_millis(50),
        ..ListenConfig::default()
    };

    let result = counting_server().serve(listener, config).await;
    assert!(matches!(result, Err(Error::Timeout)));
}

#[tokio::test]
async fn idle_timeout_spans_stop_flag_polls() {
    let listener = Listener::bind("tcp:127.0.0.1:0").await.unwrap();
    let config = ListenConfig {
        idle_timeout: Duration::from_millis(350),
        stop: Some(Arc::new(AtomicBool::new(false))),
        ..ListenConfig::default()
    };

    let started = std::time::Instant::now();
    let result = counting_server().serve(listener, config).await;
    assert!(matches!(result, Err(Error::Timeout)));
    // The 100ms stop-flag poll must not cut the idle window short.
    assert!(
        started.elapsed() >= Duration::from_millis(350),
        "gave up after {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn slow_reply_trips_the_connector_read_timeout() {
    let mut server = Server::new();
    server.register_call("org.example.Stall", |parameters| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(parameters)
    });

    let listener = Listener::bind("tcp:127.0.0.1:0").await.unwrap();
    let address = listener.local_address().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let config = ListenConfig {
        stop: Some(Arc::clone(&stop)),
        ..ListenConfig::default()
    };
    tokio::spawn(Arc::new(server).serve(listener, config));

    let client = Client::new(
        Connector::new(&address).with_read_timeout(Duration::from_millis(50)),
    );
    let result = client.call("org.example.Stall", Parameters::new()).await;
    assert!(matches!(result, Err(Error::Timeout)));

    stop.store(true, Ordering::SeqCst);
}
