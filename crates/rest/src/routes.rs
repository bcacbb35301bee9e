//! Typed wrappers over [`Dispatcher::send`] for the endpoints the client
//! itself depends on.

use {
    bytes::Bytes,
    http::Method,
    serde::{Deserialize, Serialize},
};

use {ferrule_config::INTERACTION_CALLBACK_ROUTE, ferrule_protocol::GatewayBot};

use crate::{dispatcher::Dispatcher, error::Result};

const JSON: &str = "application/json";

pub const GET_GATEWAY_BOT: &str = "get_gateway_bot";
pub const GET_CURRENT_USER: &str = "get_current_user";
pub const CREATE_MESSAGE: &str = "create_message";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateMessage {
    pub content: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub tts: bool,
}

impl CreateMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tts: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub content: String,
}

/// Interaction callback body. `data` is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionResponse {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Dispatcher {
    /// Gateway URL and session start limits.
    pub async fn get_gateway_bot(&self) -> Result<GatewayBot> {
        self.send(GET_GATEWAY_BOT, "", Method::GET, "/gateway/bot", None, None)
            .await?
            .json()
    }

    pub async fn get_current_user(&self) -> Result<CurrentUser> {
        self.send(GET_CURRENT_USER, "", Method::GET, "/users/@me", None, None)
            .await?
            .json()
    }

    pub async fn create_message(&self, channel_id: &str, message: &CreateMessage) -> Result<Message> {
        let body = Bytes::from(serde_json::to_vec(message)?);
        self.send(
            CREATE_MESSAGE,
            channel_id,
            Method::POST,
            &format!("/channels/{channel_id}/messages"),
            Some(JSON),
            Some(body),
        )
        .await?
        .json()
    }

    /// Reply to an interaction. The callback route is not subject to the
    /// global limit unless the configuration says otherwise.
    pub async fn create_interaction_response(
        &self,
        interaction_id: &str,
        interaction_token: &str,
        response: &InteractionResponse,
    ) -> Result<()> {
        let body = Bytes::from(serde_json::to_vec(response)?);
        self.send(
            INTERACTION_CALLBACK_ROUTE,
            interaction_id,
            Method::POST,
            &format!("/interactions/{interaction_id}/{interaction_token}/callback"),
            Some(JSON),
            Some(body),
        )
        .await?;
        Ok(())
    }
}
