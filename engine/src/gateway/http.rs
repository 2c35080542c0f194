use super::{GatewayError, GatewayResult, MessageGateway, NotificationGateway};
use async_trait::async_trait;
use mercato_messaging::wire::{NotificationPage, OutgoingMessage, SendReceipt, SendTarget, UnreadCount};
use mercato_messaging::{Conversation, ConversationId, CounterKind, Message, NotificationId, UserId};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// JSON-over-HTTP client for the marketplace backend.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    base_url: Url,
    http: reqwest::Client,
    auth_token: Option<String>,
}

impl HttpGateway {
    pub fn new(base_url: &str, auth_token: Option<String>, timeout: Duration) -> GatewayResult<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| GatewayError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            http,
            auth_token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> GatewayResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder, label: &str) -> GatewayResult<Response> {
        let response = builder.send().await.map_err(|e| map_reqwest_error(e, label))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(label, status = status.as_u16(), "backend rejected request");
        if status == StatusCode::NOT_FOUND {
            Err(GatewayError::NotFound(label.to_owned()))
        } else {
            Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder, label: &str) -> GatewayResult<T> {
        let response = self.execute(builder, label).await?;
        let bytes = response.bytes().await.map_err(|e| map_reqwest_error(e, label))?;
        serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(format!("{label}: {e}")))
    }
}

fn map_reqwest_error(error: reqwest::Error, label: &str) -> GatewayError {
    if error.is_connect() || error.is_timeout() {
        warn!(label, %error, "backend unreachable");
        GatewayError::Unavailable(format!("{label}: {error}"))
    } else {
        GatewayError::Http(error)
    }
}

#[async_trait]
impl MessageGateway for HttpGateway {
    async fn resolve_conversation(&self, a: &UserId, b: &UserId) -> GatewayResult<Conversation> {
        let url = self.endpoint(&["conversations", "resolve"])?;
        let request = self
            .request(Method::GET, url)
            .query(&[("participant_a", a.as_str()), ("participant_b", b.as_str())]);
        match self.fetch(request, "resolve conversation").await {
            Err(GatewayError::NotFound(_)) => Ok(Conversation::pending(a.clone(), b.clone())),
            other => other,
        }
    }

    async fn list_messages(&self, conversation: &ConversationId) -> GatewayResult<Vec<Message>> {
        let url = self.endpoint(&["conversations", conversation.as_str(), "messages"])?;
        self.fetch(self.request(Method::GET, url), "list messages").await
    }

    async fn send_message(&self, message: OutgoingMessage) -> GatewayResult<SendReceipt> {
        let mut form = Form::new().text("local_echo_id", message.local_echo_id.to_string());
        form = match &message.target {
            SendTarget::Conversation(id) => form.text("conversation_id", id.to_string()),
            SendTarget::Peer(peer) => form.text("peer_id", peer.to_string()),
        };
        if let Some(body) = message.body {
            form = form.text("body", body);
        }
        for attachment in message.attachments {
            let field = attachment.kind.form_field();
            let part = Part::bytes(attachment.bytes)
                .file_name(attachment.file_name)
                .mime_str(&attachment.mime_type)?;
            form = form.part(field, part);
        }

        let url = self.endpoint(&["messages"])?;
        self.fetch(self.request(Method::POST, url).multipart(form), "send message")
            .await
    }

    async fn mark_conversation_read(&self, conversation: &ConversationId) -> GatewayResult<()> {
        let url = self.endpoint(&["conversations", conversation.as_str(), "read"])?;
        self.execute(self.request(Method::POST, url), "mark conversation read")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationGateway for HttpGateway {
    async fn unread_count(&self, kind: CounterKind) -> GatewayResult<u64> {
        let url = self.endpoint(&["notifications", kind.as_str(), "unread-count"])?;
        let count: UnreadCount = self.fetch(self.request(Method::GET, url), "unread count").await?;
        Ok(count.count)
    }

    async fn list_notifications(
        &self,
        kind: CounterKind,
        page: u32,
    ) -> GatewayResult<NotificationPage> {
        let url = self.endpoint(&["notifications", kind.as_str()])?;
        let request = self
            .request(Method::GET, url)
            .query(&[("page", page.max(1))]);
        self.fetch(request, "list notifications").await
    }

    async fn mark_read(&self, id: &NotificationId) -> GatewayResult<()> {
        let url = self.endpoint(&["notifications", id.as_str(), "read"])?;
        self.execute(self.request(Method::POST, url), "mark notification read")
            .await?;
        Ok(())
    }

    async fn mark_all_read(&self, kind: CounterKind) -> GatewayResult<()> {
        let url = self.endpoint(&["notifications", kind.as_str(), "read-all"])?;
        self.execute(self.request(Method::POST, url), "mark all read")
            .await?;
        Ok(())
    }
}
