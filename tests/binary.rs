use std::{
    net::SocketAddr,
    path::Path,
    str::FromStr,
    time::Duration,
};

use futures::StreamExt;
use hickory_client::{
    client::{AsyncClient, ClientHandle},
    op::{DnsResponse, Message, Query, ResponseCode},
    proto::xfer::{DnsHandle, DnsRequest, DnsRequestOptions},
    rr::{Name, RecordType},
    udp::UdpClientStream,
};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tempfile::TempDir;
use tokio::{
    fs,
    io::AsyncWriteExt,
    net::UdpSocket,
    process::{Child, Command},
    time::{sleep, timeout},
};

async fn write_file<D: AsRef<[u8]>>(path: &Path, data: D) {
    let mut file = fs::File::create(path).await.unwrap();
    file.write_all(data.as_ref()).await.unwrap();
    file.flush().await.unwrap();
}

async fn lookup(address: &str, name: &Name, record_type: RecordType) -> Option<DnsResponse> {
    let stream = UdpClientStream::<UdpSocket>::new(SocketAddr::from_str(address).unwrap());
    let client = AsyncClient::connect(stream);
    let (client, bg) = client.await.unwrap();
    tokio::spawn(bg);

    let query = Query::query(name.clone(), record_type);
    let mut options = DnsRequestOptions::default();
    options.use_edns = true;

    timeout(Duration::from_millis(250), client.lookup(query, options).next())
        .await
        .ok()??
        .ok()
}

/// Sends the raw request and returns whatever message comes back, even an
/// error response code -- `lookup` treats those as a stream error instead.
async fn raw_query(address: &str, name: &Name, record_type: RecordType) -> Message {
    let stream = UdpClientStream::<UdpSocket>::new(SocketAddr::from_str(address).unwrap());
    let client = AsyncClient::connect(stream);
    let (mut client, bg) = client.await.unwrap();
    tokio::spawn(bg);

    let mut message = Message::new();
    message.add_query(Query::query(name.clone(), record_type));
    message.set_recursion_desired(true);

    let request = DnsRequest::new(message, DnsRequestOptions::default());

    client
        .send(request)
        .next()
        .await
        .unwrap()
        .map(|response| response.into_message())
        .unwrap_or_else(|_| {
            let mut message = Message::new();
            message.set_response_code(ResponseCode::ServFail);
            message
        })
}

async fn wait_for_response(address: &str, name: &Name, record_type: RecordType) {
    let result = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(response) = lookup(address, name, record_type).await {
                if response.response_code() == ResponseCode::NoError {
                    return;
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    if result.is_err() {
        panic!("timed out waiting for a response");
    }
}

fn command() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_geoedge"));
    command.env("RUST_LOG", "warn").kill_on_drop(true);
    command
}

async fn kill_server(mut child: Child) {
    let pid = Pid::from_raw(child.id().unwrap() as i32);

    for signal in [Signal::SIGTERM, Signal::SIGKILL] {
        kill(pid, signal).unwrap();

        if timeout(Duration::from_secs(5), child.wait()).await.is_ok() {
            return;
        }
    }

    tracing::warn!("timed out waiting for child process to finish");
}

#[tracing_test::traced_test]
#[tokio::test]
async fn answers_from_local_site_after_control_api_push() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("geoedge.yaml");

    write_file(
        &config_file,
        r#"
base_domain: geo.example.
site:
  ip: 10.0.0.1
  lat: 40.7128
  lon: -74.0060
server:
  port: 53541
api:
  address: 127.0.0.1:53641
"#,
    )
    .await;

    let child = command().arg(&config_file).spawn().unwrap();

    let http = reqwest::Client::new();
    let response = timeout(Duration::from_secs(5), async {
        loop {
            let result = http
                .post("http://127.0.0.1:53641/v1/services/local")
                .json(&serde_json::json!({ "op": "add", "names": ["checkout"] }))
                .send()
                .await;

            if let Ok(response) = result {
                if response.status().is_success() {
                    return;
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    response.expect("control api never came up");

    wait_for_response(
        "127.0.0.1:53541",
        &Name::from_utf8("checkout.geo.example.").unwrap(),
        RecordType::A,
    )
    .await;

    kill_server(child).await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn refuses_queries_outside_base_domain() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("geoedge.yaml");

    write_file(
        &config_file,
        r#"
base_domain: geo.example.
site:
  ip: 10.0.0.1
  lat: 40.7128
  lon: -74.0060
server:
  port: 53542
api:
  address: 127.0.0.1:53642
"#,
    )
    .await;

    let child = command().arg(&config_file).spawn().unwrap();

    let http = reqwest::Client::new();
    let added = timeout(Duration::from_secs(5), async {
        loop {
            let result = http
                .post("http://127.0.0.1:53642/v1/services/local")
                .json(&serde_json::json!({ "op": "add", "names": ["checkout"] }))
                .send()
                .await;

            if let Ok(response) = result {
                if response.status().is_success() {
                    return;
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    added.expect("control api never came up");

    // Proves the server is actually serving before asserting on the
    // out-of-domain query below.
    wait_for_response(
        "127.0.0.1:53542",
        &Name::from_utf8("checkout.geo.example.").unwrap(),
        RecordType::A,
    )
    .await;

    let response = timeout(
        Duration::from_secs(5),
        raw_query(
            "127.0.0.1:53542",
            &Name::from_utf8("other.example.").unwrap(),
            RecordType::A,
        ),
    )
    .await
    .unwrap();

    assert_eq!(response.response_code(), ResponseCode::Refused);

    kill_server(child).await;
}
