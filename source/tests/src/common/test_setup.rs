use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use pingora::server::Server;
use portico::proxy::{portico_proxy_service, ProxyState};
use portico_config::loader::ConfigLoader;

/// Boot a full proxy from a JSON configuration string and run it on a
/// background thread. The thread never joins; it lives until the test
/// process exits.
pub fn spawn_proxy(config_json: &str) -> thread::JoinHandle<()> {
    let config = ConfigLoader
        .load_str(config_json)
        .expect("test configuration should parse");
    config
        .validate()
        .expect("test configuration should validate");

    let state = ProxyState::from_config(config).expect("proxy state should build");

    let mut app_server = Server::new_with_opt_and_conf(
        state.config.pingora_opt(),
        state.config.pingora_server_conf(),
    );

    let proxy_service =
        portico_proxy_service(state, &app_server).expect("proxy service should build");

    app_server.bootstrap();
    app_server.add_services(vec![proxy_service]);

    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        tx.send(()).expect("Failed to send ready signal");
        app_server.run_forever();
    });

    rx.recv().expect("Server failed to start");

    handle
}

/// Poll the ping endpoint until the listener answers.
pub async fn wait_for_ready(base: &str) {
    for _ in 0..50 {
        if let Ok(response) = reqwest::get(format!("{base}/ping")).await {
            if response.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("proxy at {base} did not become ready");
}
