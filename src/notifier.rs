use crate::backup::{BackupOutcome, RunResult};
use crate::error::NotifyError;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatDestination {
    pub id: String,
    pub display_name: String,
}

/// The slice of the chat platform the notifier talks to.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Every chat the bot is a member of.
    async fn list_joined_chats(&self) -> Result<Vec<ChatDestination>, NotifyError>;

    /// Post an interactive card to one chat.
    async fn send_interactive(&self, chat_id: &str, card: &Value) -> Result<(), NotifyError>;
}

/// Lark / Feishu open platform client authenticated with a tenant access token.
///
/// Tenant tokens expire (two hours on Lark), so the token is re-exchanged
/// shortly before its advertised expiry.
pub struct LarkClient {
    http: reqwest::Client,
    api_base: String,
    app_id: String,
    app_secret: String,
    token: Mutex<TenantToken>,
}

struct TenantToken {
    value: String,
    refresh_at: Instant,
}

/// Refresh this long before the token would expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatPage {
    #[serde(default)]
    items: Vec<ChatItem>,
    #[serde(default)]
    has_more: bool,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatItem {
    chat_id: String,
    #[serde(default)]
    name: String,
}

impl<T> ApiResponse<T> {
    fn into_data(self, api: &'static str) -> Result<Option<T>, NotifyError> {
        if self.code != 0 {
            return Err(NotifyError::Api {
                api,
                code: self.code,
                msg: self.msg,
            });
        }
        Ok(self.data)
    }
}

impl LarkClient {
    /// Exchange the app credentials for a tenant access token. A rejected
    /// exchange is returned here, before any backup work starts.
    pub async fn connect(
        api_base: &str,
        app_id: &str,
        app_secret: &str,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let api_base = api_base.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let token = fetch_token(&http, &api_base, app_id, app_secret).await?;
        info!("Authenticated with Lark as app {}", app_id);

        Ok(Self {
            http,
            api_base,
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            token: Mutex::new(token),
        })
    }

    /// Current tenant token, re-exchanged once it is due for refresh.
    async fn bearer(&self) -> Result<String, NotifyError> {
        let mut token = self.token.lock().await;
        if Instant::now() >= token.refresh_at {
            debug!("Refreshing Lark tenant access token");
            *token = fetch_token(&self.http, &self.api_base, &self.app_id, &self.app_secret).await?;
        }
        Ok(token.value.clone())
    }

    async fn decode<T: DeserializeOwned>(
        api: &'static str,
        response: reqwest::Response,
    ) -> Result<Option<T>, NotifyError> {
        let body = response.text().await?;
        let parsed: ApiResponse<T> =
            serde_json::from_str(&body).map_err(|e| NotifyError::Malformed {
                api,
                message: format!("{e}; body={body}"),
            })?;
        parsed.into_data(api)
    }
}

#[async_trait]
impl ChatApi for LarkClient {
    async fn list_joined_chats(&self) -> Result<Vec<ChatDestination>, NotifyError> {
        let mut chats = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(format!("{}/im/v1/chats", self.api_base))
                .bearer_auth(self.bearer().await?)
                .query(&[("page_size", "100")]);
            if let Some(token) = page_token.take() {
                request = request.query(&[("page_token", token)]);
            }

            let page: ChatPage = Self::decode("im/v1/chats", request.send().await?)
                .await?
                .ok_or(NotifyError::Malformed {
                    api: "im/v1/chats",
                    message: "missing data".to_string(),
                })?;

            chats.extend(page.items.into_iter().map(|item| ChatDestination {
                id: item.chat_id,
                display_name: item.name,
            }));

            match page.page_token {
                Some(token) if page.has_more && !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(chats)
    }

    async fn send_interactive(&self, chat_id: &str, card: &Value) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(format!("{}/im/v1/messages", self.api_base))
            .bearer_auth(self.bearer().await?)
            .query(&[("receive_id_type", "chat_id")])
            .json(&json!({
                "receive_id": chat_id,
                "msg_type": "interactive",
                "content": card.to_string(),
            }))
            .send()
            .await?;
        Self::decode::<Value>("im/v1/messages", response).await?;
        Ok(())
    }
}

async fn fetch_token(
    http: &reqwest::Client,
    api_base: &str,
    app_id: &str,
    app_secret: &str,
) -> Result<TenantToken, NotifyError> {
    let response: TokenResponse = http
        .post(format!("{}/auth/v3/tenant_access_token/internal", api_base))
        .json(&json!({ "app_id": app_id, "app_secret": app_secret }))
        .send()
        .await?
        .json()
        .await?;
    if response.code != 0 {
        return Err(NotifyError::Api {
            api: "tenant_access_token",
            code: response.code,
            msg: response.msg,
        });
    }
    let value = response
        .tenant_access_token
        .filter(|token| !token.is_empty())
        .ok_or(NotifyError::Malformed {
            api: "tenant_access_token",
            message: "missing tenant_access_token".to_string(),
        })?;

    let lifetime = Duration::from_secs(response.expire).saturating_sub(TOKEN_REFRESH_MARGIN);
    Ok(TenantToken {
        value,
        refresh_at: Instant::now() + lifetime,
    })
}

/// Keep the joined chats whose display name is on the allow-list.
pub fn filter_destinations(
    joined: Vec<ChatDestination>,
    allow_list: &[String],
) -> Vec<ChatDestination> {
    joined
        .into_iter()
        .filter(|chat| allow_list.iter().any(|name| *name == chat.display_name))
        .collect()
}

/// Names of the chats a card was posted to, and of those it could not be.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Notifier {
    chat: Arc<dyn ChatApi>,
    allow_list: Vec<String>,
    console_url: String,
}

impl Notifier {
    pub fn new(chat: Arc<dyn ChatApi>, allow_list: Vec<String>, console_url: String) -> Self {
        Self {
            chat,
            allow_list,
            console_url,
        }
    }

    pub async fn resolve_destinations(&self) -> Result<Vec<ChatDestination>, NotifyError> {
        let joined = self.chat.list_joined_chats().await.map_err(|e| {
            error!("Failed to list chats joined by the bot: {}", e);
            e
        })?;
        info!(
            "Bot joined chats: {:?}",
            joined
                .iter()
                .map(|c| (c.id.as_str(), c.display_name.as_str()))
                .collect::<Vec<_>>()
        );
        info!("Configured chat names: {:?}", self.allow_list);

        let destinations = filter_destinations(joined, &self.allow_list);
        for destination in &destinations {
            info!("Found chat: {} ({})", destination.display_name, destination.id);
        }
        Ok(destinations)
    }

    /// Post the run report to every resolved chat. Only destination
    /// resolution can fail; a chat that rejects the card is logged and skipped.
    pub async fn notify(&self, result: &RunResult) -> Result<DeliveryReport, NotifyError> {
        let card = render_card(result, &self.console_url, Local::now());
        let destinations = self.resolve_destinations().await?;

        let mut report = DeliveryReport::default();
        for destination in destinations {
            match self.chat.send_interactive(&destination.id, &card).await {
                Ok(()) => {
                    info!("[MESSAGE] Send to chat success: {:?}", destination.display_name);
                    report.delivered.push(destination.display_name);
                }
                Err(e) => {
                    error!(
                        "[MESSAGE] Send to chat {:?} failed: {}",
                        destination.display_name, e
                    );
                    report.failed.push(destination.display_name);
                }
            }
        }
        Ok(report)
    }
}

fn outcome_lines(outcomes: &[BackupOutcome]) -> String {
    outcomes
        .iter()
        .map(|o| format!("**{}**: {} > {}\n", o.endpoint.name, o.endpoint.address, o.detail))
        .collect()
}

/// Build the interactive card summarising `result`.
pub fn render_card(result: &RunResult, console_url: &str, finished_at: DateTime<Local>) -> Value {
    let template = if result.failures.is_empty() {
        "green"
    } else {
        "red"
    };

    let mut elements = vec![json!({ "tag": "hr" })];
    if !result.failures.is_empty() {
        elements.push(json!({
            "tag": "markdown",
            "content": format!("**🔴  Backup failed:**\n{}", outcome_lines(&result.failures)),
        }));
        elements.push(json!({ "tag": "hr" }));
    }
    elements.push(json!({
        "tag": "markdown",
        "content": format!("**🎉  Backup succeeded:**\n{}", outcome_lines(&result.successes)),
    }));
    elements.push(json!({ "tag": "hr" }));
    elements.push(json!({
        "tag": "markdown",
        "content": format!("[**>>> View backups <<<**]({})", console_url),
    }));
    elements.push(json!({
        "tag": "note",
        "elements": [{
            "tag": "plain_text",
            "content": format!("✅ Finished at: {}", finished_at.format("%Y-%m-%d %H:%M:%S")),
        }],
    }));

    json!({
        "config": { "wide_screen_mode": true },
        "header": {
            "template": template,
            "title": {
                "tag": "plain_text",
                "content": format!("Cluster: {} etcd backup report", result.cluster_name),
            },
        },
        "elements": elements,
    })
}
