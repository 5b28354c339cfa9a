//! stdio-to-streamable-HTTP bridge
//!
//! Runs the proxy as a stdio child of an MCP client, forwarding each frame
//! one-to-one to a streamable HTTP endpoint (typically another instance of
//! this proxy). Session context rides on the target URL as query parameters
//! so the far end can restore filters and attribution.

use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{JsonRpcError, JsonRpcMessage, JsonRpcResponse};
use crate::session::SessionContext;

/// Header carrying the streamable HTTP session id
const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// One-to-one bridge between local stdio and an upstream MCP endpoint
pub struct StdioBridge {
    target: Url,
    client: reqwest::Client,
    session_id: Option<String>,
}

impl StdioBridge {
    /// Build a bridge to `url`, attaching the session context as query
    /// parameters
    pub fn new(url: &str, context: &SessionContext) -> ProxyResult<Self> {
        let session_seed = format!("stream-{}", Uuid::new_v4());
        let mut target = Url::parse(url)?;
        for (key, value) in context.query_pairs(&session_seed) {
            target.query_pairs_mut().append_pair(&key, &value);
        }
        Ok(Self {
            target,
            client: reqwest::Client::new(),
            session_id: None,
        })
    }

    /// Target URL including context parameters
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Bridge the process's own stdin/stdout
    pub async fn run_stdio(&mut self) -> ProxyResult<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Pump frames between `reader`/`writer` and the HTTP endpoint until the
    /// reader closes
    pub async fn run<R, W>(&mut self, reader: R, mut writer: W) -> ProxyResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let message = match JsonRpcMessage::parse(line) {
                Ok(message) => message,
                Err(e) => {
                    debug!("unparseable inbound frame: {}", e);
                    let response = JsonRpcResponse::failure(
                        JsonRpcError::new(
                            crate::protocol::error_codes::PARSE_ERROR,
                            "Parse error",
                        ),
                        None,
                    );
                    write_frame(&mut writer, &response).await?;
                    continue;
                }
            };

            match self.forward(&message).await {
                Ok(Some(response)) => write_frame(&mut writer, &response).await?,
                Ok(None) => {}
                Err(e) => {
                    warn!("forwarding failed: {}", e);
                    let id = match &message {
                        JsonRpcMessage::Request(request) => request.id.clone(),
                        JsonRpcMessage::Response(_) => None,
                    };
                    if id.is_some() {
                        let response = JsonRpcResponse::failure(e.into(), id);
                        write_frame(&mut writer, &response).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn forward(&mut self, message: &JsonRpcMessage) -> ProxyResult<Option<JsonRpcResponse>> {
        let mut request = self
            .client
            .post(self.target.clone())
            .header(ACCEPT, "application/json")
            .json(message);
        if let Some(session_id) = &self.session_id {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }

        let response = request.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ProxyError::OauthRequired {
                upstream: self.target.to_string(),
                authorization_url: None,
            });
        }
        if !response.status().is_success() {
            return Err(ProxyError::Transport {
                message: format!("endpoint returned {}", response.status()),
            });
        }

        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let parsed: JsonRpcResponse =
            serde_json::from_str(&body).map_err(|e| ProxyError::Protocol {
                message: format!("invalid response body: {}", e),
            })?;
        Ok(Some(parsed))
    }
}

async fn write_frame<W>(writer: &mut W, response: &JsonRpcResponse) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = serde_json::to_string(response)?;
    frame.push('\n');
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
