//! Shared fixtures: a full service stack over a temp directory, with a
//! static asset inventory standing in for the asset directory.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use toolhub_core::assets::{
    Asset, ConnectionProfile, Credential, Inventory, StaticAssetDirectory,
};
use toolhub_core::runtime::{self, Collaborators};
use toolhub_core::secrets::SecretCipher;
use toolhub_core::server::{self, AppState};
use toolhub_core::Config;
use tower::ServiceExt;

pub const INTERNAL_KEY: &str = "integration-internal-key";

pub const ECHO: &str = r#"
name: echo
version: "1.0.0"
category: utility
description: Echo the input back
execution_method: builtin
entrypoint: echo
capabilities:
  - name: echo
    description: Return what was sent
    patterns:
      - name: echo_text
        description: Echo text back to the caller, ping answers pong
        typical_use_cases: ["connectivity smoke test"]
        required_inputs:
          - { name: input, type: string, required: true }
"#;

pub const CONN_CHECK: &str = r#"
name: conn_check
version: "1.0.0"
platform: any
category: diagnostics
description: Verify the service can authenticate against a host
execution_method: builtin
entrypoint: connection_check
metadata:
  requires_auth: true
capabilities:
  - name: connectivity
    patterns:
      - name: check_login
        description: Check that stored credentials log in to the host
        required_inputs:
          - { name: host, type: string, required: true }
"#;

pub const DISK_USAGE: &str = r#"
name: disk_usage
version: "1.2.0"
platform: linux
category: diagnostics
description: Report filesystem usage
execution_method: builtin
entrypoint: echo
capabilities:
  - name: storage
    description: Disk and filesystem inspection
    patterns:
      - name: usage_by_mount
        description: Show disk usage per mount point
        typical_use_cases: ["disk full", "free space on mounts"]
        allow_extra_inputs: true
"#;

pub const WIN_EVENTS: &str = r#"
name: win_events
version: "2.0.0"
platform: windows
category: diagnostics
description: Read the Windows event log
execution_method: builtin
entrypoint: echo
capabilities:
  - name: eventlog
    patterns:
      - name: recent_errors
        description: List recent error events from the Windows event log
        allow_extra_inputs: true
"#;

pub const SLOW: &str = r#"
name: slow
version: "1.0.0"
category: utility
description: Sleeps, used to exercise deadlines
execution_method: builtin
entrypoint: sleep
capabilities:
  - name: wait
    patterns:
      - name: sleep
        description: Sleep for the requested milliseconds
        allow_extra_inputs: true
        policy:
          max_execution_time: 100ms
"#;

pub struct TestApp {
    pub dir: TempDir,
    pub state: AppState,
    pub public: Router,
    pub internal: Router,
}

impl TestApp {
    pub fn definitions_dir(&self) -> PathBuf {
        self.dir.path().join("tools")
    }

    pub fn write_definition(&self, file: &str, yaml: &str) {
        std::fs::write(self.definitions_dir().join(file), yaml).unwrap();
    }

    pub fn remove_definition(&self, file: &str) {
        std::fs::remove_file(self.definitions_dir().join(file)).unwrap();
    }
}

fn inventory(cipher: &SecretCipher) -> Inventory {
    Inventory {
        assets: vec![
            Asset {
                host: "db01.lan".into(),
                ip: Some("10.0.0.5".into()),
                platform: "linux".into(),
                connection: ConnectionProfile {
                    protocol: "ssh".into(),
                    port: Some(22),
                },
                tags: vec!["database".into()],
            },
            Asset {
                host: "win01.lan".into(),
                ip: Some("10.0.0.9".into()),
                platform: "windows".into(),
                connection: ConnectionProfile {
                    protocol: "winrm".into(),
                    port: Some(5986),
                },
                tags: vec![],
            },
        ],
        credentials: vec![Credential {
            asset_host: "db01.lan".into(),
            purpose: "ssh".into(),
            username: "ops".into(),
            encrypted_secret: cipher.encrypt("hunter2").unwrap(),
            protocol: None,
        }],
    }
}

/// Full stack with ECHO, CONN_CHECK, DISK_USAGE, WIN_EVENTS and SLOW loaded.
pub async fn spawn_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let defs = dir.path().join("tools");
    std::fs::create_dir(&defs).unwrap();
    for (file, yaml) in [
        ("echo.yaml", ECHO),
        ("conn_check.yaml", CONN_CHECK),
        ("disk_usage.yaml", DISK_USAGE),
        ("win_events.yaml", WIN_EVENTS),
        ("slow.yaml", SLOW),
    ] {
        std::fs::write(defs.join(file), yaml).unwrap();
    }

    let master_key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
    let cipher = SecretCipher::from_base64(&master_key).unwrap();

    let mut config = Config::default();
    config.catalog.definitions_dir = defs;
    config.catalog.database_path = dir.path().join("catalog.db");
    config.secrets.internal_key = INTERNAL_KEY.to_string();
    config.secrets.master_key = master_key;
    config.embedding.dimensions = 64;
    // Backfill runs inline below so generations are predictable.
    config.embedding.backfill_on_reload = false;

    let collaborators = Collaborators {
        directory: Some(Arc::new(StaticAssetDirectory::new(inventory(&cipher)))),
        ..Collaborators::default()
    };
    let state = runtime::build(&config, collaborators).await.unwrap();
    runtime::bootstrap(&state).await.unwrap();
    if let Some(indexer) = &state.indexer {
        indexer.backfill(None, false).await.unwrap();
    }

    TestApp {
        dir,
        public: server::public_router(state.clone()),
        internal: server::internal_router(state.clone()),
        state,
    }
}

/// One request through a router. Returns status, JSON body (Null when the
/// body is not JSON) and the echoed trace id.
pub async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value, Option<String>) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let trace = response
        .headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json, trace)
}

/// Raw text body, for `/metrics` and `/ai/tools/prompt`.
pub async fn call_text(router: &Router, uri: &str) -> String {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Value of one exposition line, 0 when the series does not exist yet.
pub fn metric_value(exposition: &str, series: &str) -> f64 {
    exposition
        .lines()
        .find(|line| line.starts_with(series) && line[series.len()..].starts_with(' '))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}
