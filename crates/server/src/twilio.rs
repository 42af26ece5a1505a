//! Twilio REST call transfer
//!
//! Redirects a live call by replacing its TwiML with a `<Dial>` to the
//! escalation destination.

use async_trait::async_trait;
use phone_agent_core::{CallTransfer, Error};
use std::time::Duration;

use crate::ServerError;

/// Twilio REST configuration
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub api_base: String,
    pub account_sid: String,
    pub auth_token: String,
    pub timeout: Duration,
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.twilio.com".to_string(),
            account_sid: String::new(),
            auth_token: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl From<&phone_agent_config::TelephonyConfig> for TwilioConfig {
    fn from(config: &phone_agent_config::TelephonyConfig) -> Self {
        Self {
            api_base: config.api_base.clone(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Call transfer through the Twilio Calls API
pub struct TwilioCallTransfer {
    client: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioCallTransfer {
    pub fn new(config: TwilioConfig) -> Result<Self, ServerError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServerError::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn call_url(&self, call_sid: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid,
            call_sid
        )
    }
}

/// TwiML that dials the destination
pub fn dial_twiml(destination: &str) -> String {
    format!(
        "<Response><Dial>{}</Dial></Response>",
        xml_escape(destination.trim())
    )
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[async_trait]
impl CallTransfer for TwilioCallTransfer {
    async fn transfer(&self, call_id: &str, destination: &str) -> phone_agent_core::Result<()> {
        if call_id.is_empty() {
            return Err(Error::Transfer("missing call id".to_string()));
        }
        if destination.trim().is_empty() {
            return Err(Error::Transfer("no escalation destination configured".to_string()));
        }

        let response = self
            .client
            .post(self.call_url(call_id))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("Twiml", dial_twiml(destination))])
            .send()
            .await
            .map_err(|e| Error::Transfer(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Transfer(format!("HTTP {}: {}", status, error_text)));
        }

        tracing::info!(call_id = %call_id, destination = %destination, "Call redirected");
        Ok(())
    }
}
