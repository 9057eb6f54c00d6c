use async_trait::async_trait;
use regex::Regex;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use url::Url;

/// Tag-assignment failures. Per-tag faults are recoverable: the event
/// handler logs them and moves on to the remaining tags.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("koji request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid koji hub URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("koji fault {code}: {message}")]
    Fault { code: i64, message: String },
    #[error("could not parse koji response to {0}")]
    BadResponse(&'static str),
}

/// The tagging backend seam. One session spans all tags of one event:
/// open, N `tag_build` calls, close. Closing must always happen, even when
/// individual assignments failed, so it cannot error.
#[async_trait]
pub trait TagDispatcher {
    type Session: Send + Sync;

    async fn open_session(&self) -> Result<Self::Session, DispatchError>;
    async fn tag_build(
        &self,
        session: &Self::Session,
        tag: &str,
        nvr: &str,
    ) -> Result<(), DispatchError>;
    async fn close_session(&self, session: Self::Session);
}

/// Authenticated koji hub session parameters. The hub requires a
/// monotonically increasing callnum on every authenticated call.
pub struct SessionAuth {
    session_id: String,
    session_key: String,
    callnum: AtomicI64,
}

pub struct KojiSession {
    auth: Option<SessionAuth>,
}

/// Minimal XML-RPC client for the koji hub, covering exactly the calls the
/// tagging flow needs: login, tagBuild, logout.
pub struct KojiClient {
    hub_url: Url,
    client: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl KojiClient {
    pub fn new(
        hub_url: &str,
        credentials: Option<(String, String)>,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("module-tagger/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(KojiClient {
            hub_url: Url::parse(hub_url)?,
            client,
            credentials,
        })
    }

    async fn call(
        &self,
        auth: Option<&SessionAuth>,
        method: &'static str,
        params: &[&str],
    ) -> Result<String, DispatchError> {
        let mut url = self.hub_url.clone();
        if let Some(auth) = auth {
            let callnum = auth.callnum.fetch_add(1, Ordering::SeqCst);
            url.query_pairs_mut()
                .append_pair("session-id", &auth.session_id)
                .append_pair("session-key", &auth.session_key)
                .append_pair("callnum", &callnum.to_string());
        }
        let body = xmlrpc_request(method, params);
        log::debug!("Calling koji method {method}");
        let response = self
            .client
            .post(url)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        let text = response.text().await?;
        if let Some((code, message)) = parse_fault(&text) {
            return Err(DispatchError::Fault { code, message });
        }
        Ok(text)
    }
}

#[async_trait]
impl TagDispatcher for KojiClient {
    type Session = KojiSession;

    async fn open_session(&self) -> Result<KojiSession, DispatchError> {
        let (user, password) = match &self.credentials {
            Some(credentials) => credentials,
            None => {
                log::warn!("No koji credentials configured, calling the hub unauthenticated");
                return Ok(KojiSession { auth: None });
            }
        };
        let response = self
            .call(None, "login", &[user.as_str(), password.as_str()])
            .await?;
        let session_id = parse_member_int(&response, "session-id")
            .ok_or(DispatchError::BadResponse("login"))?;
        let session_key = parse_member_string(&response, "session-key")
            .ok_or(DispatchError::BadResponse("login"))?;
        log::debug!("Logged in to koji as {user}");
        Ok(KojiSession {
            auth: Some(SessionAuth {
                session_id: session_id.to_string(),
                session_key,
                callnum: AtomicI64::new(0),
            }),
        })
    }

    async fn tag_build(
        &self,
        session: &KojiSession,
        tag: &str,
        nvr: &str,
    ) -> Result<(), DispatchError> {
        self.call(session.auth.as_ref(), "tagBuild", &[tag, nvr])
            .await?;
        log::info!("Tagged build {nvr} into {tag}");
        Ok(())
    }

    async fn close_session(&self, session: KojiSession) {
        let auth = match session.auth {
            Some(auth) => auth,
            None => return,
        };
        if let Err(e) = self.call(Some(&auth), "logout", &[]).await {
            log::warn!("Failed to log out of koji: {e}");
        }
    }
}

fn xmlrpc_request(method: &str, params: &[&str]) -> String {
    let mut body = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    body.push_str(method);
    body.push_str("</methodName><params>");
    for param in params {
        body.push_str("<param><value><string>");
        body.push_str(&escape_xml(param));
        body.push_str("</string></value></param>");
    }
    body.push_str("</params></methodCall>");
    body
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn parse_fault(response: &str) -> Option<(i64, String)> {
    if !response.contains("<fault>") {
        return None;
    }
    let code = parse_member_int(response, "faultCode").unwrap_or(-1);
    let message =
        parse_member_string(response, "faultString").unwrap_or_else(|| "unknown fault".to_string());
    Some((code, message))
}

fn parse_member_int(response: &str, name: &str) -> Option<i64> {
    let pattern = format!(
        r"<name>{}</name>\s*<value>\s*<(?:int|i4)>(-?\d+)</(?:int|i4)>",
        regex::escape(name)
    );
    let regex = Regex::new(&pattern).unwrap();
    regex
        .captures(response)
        .and_then(|captures| captures.get(1))
        .and_then(|group| group.as_str().parse().ok())
}

fn parse_member_string(response: &str, name: &str) -> Option<String> {
    let pattern = format!(
        r"<name>{}</name>\s*<value>\s*<string>([^<]*)</string>",
        regex::escape(name)
    );
    let regex = Regex::new(&pattern).unwrap();
    regex
        .captures(response)
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str().to_string())
}
