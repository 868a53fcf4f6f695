use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tokio::time::sleep;
use video_access::Config;

pub static SHARED_SERVER: OnceCell<TestServer> = OnceCell::const_new();

/// Test harness running the real service on its own runtime thread
pub struct TestServer {
    _handle: JoinHandle<()>,
    e_port: u16,
    i_port: u16,
    workspace: PathBuf,
}

impl TestServer {
    /// Get or create shared test server instance
    pub async fn shared() -> &'static TestServer {
        SHARED_SERVER.get_or_init(|| async { Self::start().await }).await
    }

    async fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let e_port = portpicker::pick_unused_port().expect("No available port");
        let i_port = portpicker::pick_unused_port().expect("No available port");

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        let workspace = PathBuf::from(format!("/tmp/video-access-test-{now}"));
        let _ = tokio::fs::remove_dir_all(&workspace).await;

        let config = Config {
            listen_on_port: e_port,
            internal_port: i_port,
            workspace: workspace.to_string_lossy().into_owned(),
            delivery_ttl_ceiling_secs: 120,
            ..Default::default()
        };

        // Spawn the server in a separate thread with its own runtime
        let handle = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                video_access::run(config).await.unwrap();
            });
        });

        let server = TestServer {
            _handle: handle,
            e_port,
            i_port,
            workspace,
        };

        // Poll until server is ready
        let client = server.client();
        for _ in 0..200 {
            if let Ok(response) = client
                .get(format!("{}/health", server.int_url()))
                .send()
                .await
                && response.status().is_success()
            {
                break;
            }

            sleep(Duration::from_millis(10)).await;
        }

        server
    }

    pub fn int_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.i_port)
    }

    pub fn ext_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.e_port)
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    /// Write an object into local storage
    pub async fn put_object(&self, storage_key: &str, data: &[u8]) {
        let path = self.workspace.join("objects").join(storage_key);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, data).await.unwrap();
    }

    pub async fn create_session(&self, client: &reqwest::Client, principal_id: &str) -> String {
        let response = client
            .post(format!("{}/sessions", self.int_url()))
            .json(&json!({ "principal_id": principal_id }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let body: Value = response.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    pub async fn register_asset(
        &self,
        client: &reqwest::Client,
        asset_id: &str,
        storage_key: &str,
    ) -> reqwest::Response {
        client
            .put(format!("{}/catalog/{asset_id}", self.int_url()))
            .json(&json!({ "storage_key": storage_key }))
            .send()
            .await
            .unwrap()
    }

    pub async fn record_purchase(&self, client: &reqwest::Client, event: Value) -> reqwest::Response {
        client
            .post(format!("{}/purchases", self.int_url()))
            .json(&event)
            .send()
            .await
            .unwrap()
    }

    /// Make an authenticated GET request against the external API
    pub async fn get_with_auth(
        &self,
        client: &reqwest::Client,
        path: &str,
        token: &str,
    ) -> reqwest::Response {
        client
            .get(format!("{}{}", self.ext_url(), path))
            .header("Authorization", format!("Bearer {token}"))
            .send()
            .await
            .unwrap()
    }
}
