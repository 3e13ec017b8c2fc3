use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use thiserror::Error;
use wirechat_core::{CODE_OK, ChatListEntry, GroupId, Message, UserId};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server replied {code}: {msg}")]
    Server { code: u16, msg: String },
}

/// REST collaborator: the roster and paginated backward history live
/// behind plain HTTP endpoints, not the socket.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn chat_list(&self) -> Result<Vec<ChatListEntry>, ApiError>;

    async fn history(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, ApiError>;

    async fn group_history(
        &self,
        group_id: GroupId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, ApiError>;
}

/// Server reply envelope shared by every REST endpoint.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Envelope<T> {
    code: u16,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct HistoryPage {
    #[serde(default)]
    list: Vec<Message>,
}

pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let envelope: Envelope<T> = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?
            .json()
            .await?;

        if envelope.code != CODE_OK {
            return Err(ApiError::Server {
                code: envelope.code,
                msg: envelope.msg.unwrap_or_else(|| "request failed".to_owned()),
            });
        }
        envelope.data.ok_or(ApiError::Server {
            code: envelope.code,
            msg: "reply is missing data".to_owned(),
        })
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn chat_list(&self) -> Result<Vec<ChatListEntry>, ApiError> {
        self.get_json("user/chat/list", &[]).await
    }

    async fn history(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let page_result: HistoryPage = self
            .get_json(
                &format!("message/between/{sender_id}/{receiver_id}"),
                &[("page", page.to_string()), ("pageSize", page_size.to_string())],
            )
            .await?;
        Ok(page_result.list)
    }

    async fn group_history(
        &self,
        group_id: GroupId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let page_result: HistoryPage = self
            .get_json(
                &format!("message/group/{group_id}"),
                &[("page", page.to_string()), ("pageSize", page_size.to_string())],
            )
            .await?;
        Ok(page_result.list)
    }
}
