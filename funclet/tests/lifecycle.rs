//! End-to-end lifecycle against real spawned service processes, using the
//! `fact_service` host binary.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use funclet::{
    Artifact, CallArgs, HandleState, HostBinarySpawner, PortSelection, ServiceBuilder, port,
};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn spawner() -> Arc<HostBinarySpawner> {
    Arc::new(HostBinarySpawner::new(env!("CARGO_BIN_EXE_fact_service")))
}

async fn wait_until_unbound(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while port::is_port_bound(LOOPBACK, port) {
        assert!(
            Instant::now() < deadline,
            "port {port} still bound long after teardown"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launch_call_reattach_and_relaunch() {
    let artifact = Artifact::new("fact", b"fact_service artifact v1".to_vec());

    let mut handle = ServiceBuilder::new(artifact.clone())
        .with_port(PortSelection::AnyFree)
        .with_spawner(spawner())
        .serve()
        .await
        .unwrap();
    assert!(handle.owns_process());
    let service_port = handle.address().port();

    // Both call disciplines against the live process.
    let out = handle.call(&CallArgs::positional([json!(5)])).await.unwrap();
    assert_eq!(out, json!(120));
    let out = handle
        .call_blocking(&CallArgs::positional([json!(-1)]))
        .unwrap();
    assert_eq!(out, json!("Default"));

    // Named default overrides the baked-in one.
    let out = handle
        .call(&CallArgs::positional([json!(-3)]).kwarg("default", json!("nope")))
        .await
        .unwrap();
    assert_eq!(out, json!("nope"));

    // Five concurrent calls, each matched to its own request.
    let args_a = CallArgs::positional([json!(-1)]);
    let args_b = CallArgs::positional([json!(2)]);
    let args_c = CallArgs::positional([json!(3)]);
    let args_d = CallArgs::positional([json!(4)]);
    let args_e = CallArgs::positional([json!(5)]);
    let (a, b, c, d, e) = tokio::join!(
        handle.call(&args_a),
        handle.call(&args_b),
        handle.call(&args_c),
        handle.call(&args_d),
        handle.call(&args_e),
    );
    assert_eq!(
        (a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap(), e.unwrap()),
        (json!("Default"), json!(2), json!(6), json!(24), json!(120))
    );

    // A second handle for the same address attaches instead of relaunching.
    let mut second = ServiceBuilder::new(artifact.clone())
        .with_port(PortSelection::Explicit(service_port))
        .with_spawner(spawner())
        .serve()
        .await
        .unwrap();
    assert!(!second.owns_process());
    let out = second.call(&CallArgs::positional([json!(3)])).await.unwrap();
    assert_eq!(out, json!(6));
    second.shutdown();
    second.shutdown();

    // The serialized snapshot reattaches while the process lives.
    let encoded = serde_json::to_string(&handle.state()).unwrap();
    let state: HandleState = serde_json::from_str(&encoded).unwrap();
    {
        let revived = ServiceBuilder::from_state(state.clone())
            .with_spawner(spawner())
            .serve()
            .await
            .unwrap();
        assert!(!revived.owns_process());
        let out = revived.call(&CallArgs::positional([json!(4)])).await.unwrap();
        assert_eq!(out, json!(24));
    }

    // Teardown kills the owned process and frees the port; twice is fine.
    handle.shutdown();
    handle.shutdown();
    wait_until_unbound(service_port).await;

    // The same snapshot now launches a fresh process.
    let mut replacement = ServiceBuilder::from_state(state)
        .with_spawner(spawner())
        .serve()
        .await
        .unwrap();
    assert!(replacement.owns_process());
    let out = replacement
        .call(&CallArgs::positional([json!(6)]))
        .await
        .unwrap();
    assert_eq!(out, json!(720));

    replacement.shutdown();
    wait_until_unbound(service_port).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deterministic_address_deduplicates_services() {
    let artifact = Artifact::new("reverse", b"reverse artifact for dedup".to_vec());
    let expected = port::specific_port(artifact.payload(), port::DEFAULT_PORT_RANGE);

    let mut first = ServiceBuilder::new(artifact.clone())
        .with_spawner(spawner())
        .serve()
        .await
        .unwrap();
    assert_eq!(first.address().port(), expected);

    let second = ServiceBuilder::new(artifact)
        .with_spawner(spawner())
        .serve()
        .await
        .unwrap();
    assert_eq!(second.address().port(), expected);
    assert!(!second.owns_process(), "second construction must attach");

    let call = CallArgs::positional([json!("CBA")]).kwarg("extra", json!("DEF"));
    let (a, b) = tokio::join!(first.call(&call), second.call(&call));
    assert_eq!(a.unwrap(), json!("ABCDEF"));
    assert_eq!(b.unwrap(), json!("ABCDEF"));

    first.shutdown();
    wait_until_unbound(expected).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_handle_tears_the_service_down() {
    let artifact = Artifact::new("fact", b"fact artifact for drop test".to_vec());

    let service_port = {
        let handle = ServiceBuilder::new(artifact)
            .with_port(PortSelection::AnyFree)
            .with_spawner(spawner())
            .serve()
            .await
            .unwrap();
        assert!(handle.owns_process());
        handle.address().port()
    };

    wait_until_unbound(service_port).await;
}
