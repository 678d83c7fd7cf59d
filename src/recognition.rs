//! `POST {base}/calculate/` and the background plumbing around it.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use serde::{Deserialize, Deserializer, Serialize};

use crate::config::Config;

#[derive(thiserror::Error, Debug)]
pub enum RecognitionError {
    #[error("request to recognition service failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("recognition service answered with status {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed response from recognition service: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to start background runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CalculateRequest {
    pub image: String,                         // data URL
    pub dict_of_vars: BTreeMap<String, String>, // 变量绑定
}

#[derive(Clone, Debug, Deserialize)]
pub struct CalculateResponse {
    pub data: Vec<Evaluation>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Evaluation {
    pub expr: String,
    #[serde(deserialize_with = "result_as_text")]
    pub result: String,
    #[serde(default)]
    pub assign: bool,
}

impl Evaluation {
    pub fn new(expr: impl Into<String>, result: impl Into<String>, assign: bool) -> Self {
        Self {
            expr: expr.into(),
            result: result.into(),
            assign,
        }
    }

    /// `expr = result` wrapped in inline-math delimiters, rendered large.
    pub fn markup(&self) -> String {
        format!("\\(\\LARGE{{{} = {}}}\\)", self.expr, self.result)
    }
}

// The service sometimes sends numbers or booleans as the result.
fn result_as_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    })
}

#[derive(Clone, Debug)]
pub struct RecognitionClient {
    http: reqwest::Client,
    endpoint: String,
}

impl RecognitionClient {
    pub fn new(config: &Config) -> Self {
        Self::with_http(config, reqwest::Client::new())
    }

    pub fn with_http(config: &Config, http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: config.calculate_endpoint(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one request and decode the whole answer before returning anything.
    pub async fn calculate(
        &self,
        request: &CalculateRequest,
    ) -> Result<Vec<Evaluation>, RecognitionError> {
        let response = self.http.post(&self.endpoint).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecognitionError::Status(status));
        }

        let body = response.bytes().await?;
        let parsed: CalculateResponse = serde_json::from_slice(&body)?;
        log::debug!(
            "recognition service returned {} item(s) (status: {:?}, message: {:?})",
            parsed.data.len(),
            parsed.status,
            parsed.message
        );
        Ok(parsed.data)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitTicket {
    pub session: u64,      // 提交时的会话号，重置后递增
    pub base_count: usize, // 提交时已有的结果数量
}

#[derive(Debug)]
pub struct Completion {
    pub ticket: SubmitTicket,
    pub outcome: Result<Vec<Evaluation>, RecognitionError>,
}

// 后台发请求，结果经通道交回 UI 线程
pub struct Dispatcher {
    client: RecognitionClient,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    in_flight: usize,
    #[cfg(not(target_arch = "wasm32"))]
    runtime: tokio::runtime::Runtime,
}

impl Dispatcher {
    pub fn new(client: RecognitionClient) -> Result<Self, RecognitionError> {
        let (tx, rx) = mpsc::channel();

        #[cfg(not(target_arch = "wasm32"))]
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("recognition")
            .enable_all()
            .build()?;

        Ok(Self {
            client,
            tx,
            rx,
            in_flight: 0,
            #[cfg(not(target_arch = "wasm32"))]
            runtime,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Start a request. `ctx` is woken up when the answer arrives.
    pub fn submit(&mut self, ticket: SubmitTicket, request: CalculateRequest, ctx: &egui::Context) {
        let client = self.client.clone();
        let tx = self.tx.clone();
        let ctx = ctx.clone();
        let task = async move {
            let outcome = client.calculate(&request).await;
            if tx.send(Completion { ticket, outcome }).is_err() {
                log::warn!("completion dropped: ui is gone");
            }
            ctx.request_repaint();
        };

        log::info!("submitting canvas to {}", self.client.endpoint());
        self.in_flight += 1;

        #[cfg(not(target_arch = "wasm32"))]
        drop(self.runtime.spawn(task));

        #[cfg(target_arch = "wasm32")]
        wasm_bindgen_futures::spawn_local(task);
    }

    /// Everything that finished since the last call, in arrival order.
    pub fn drain(&mut self) -> Vec<Completion> {
        let mut done = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(completion) => done.push(completion),
                Err(TryRecvError::Empty) => break,
                // 自己持有一个 sender，不会发生
                Err(TryRecvError::Disconnected) => break,
            }
        }
        self.in_flight = self.in_flight.saturating_sub(done.len());
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let mut vars = BTreeMap::new();
        vars.insert("x".to_owned(), "5".to_owned());
        let request = CalculateRequest {
            image: "data:image/png;base64,AAAA".to_owned(),
            dict_of_vars: vars,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "image": "data:image/png;base64,AAAA",
                "dict_of_vars": { "x": "5" }
            })
        );
    }

    #[test]
    fn test_response_keeps_order_and_defaults_assign() {
        let body = r#"{
            "message": "Image processed",
            "status": "success",
            "data": [
                {"expr": "x", "result": "5", "assign": true},
                {"expr": "2 + 2", "result": 4},
                {"expr": "y > 1", "result": false, "assign": false}
            ]
        }"#;

        let response: CalculateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            response.data,
            vec![
                Evaluation::new("x", "5", true),
                Evaluation::new("2 + 2", "4", false),
                Evaluation::new("y > 1", "false", false),
            ]
        );
        assert_eq!(response.status.as_deref(), Some("success"));
    }

    #[test]
    fn test_response_without_data_is_rejected() {
        assert!(serde_json::from_str::<CalculateResponse>(r#"{"message": "oops"}"#).is_err());
        assert!(
            serde_json::from_str::<CalculateResponse>(r#"{"data": [{"result": "1"}]}"#).is_err()
        );
    }

    #[test]
    fn test_markup_wraps_in_delimiters() {
        let markup = Evaluation::new("y", "x+1", false).markup();
        assert_eq!(markup, r"\(\LARGE{y = x+1}\)");
    }
}
