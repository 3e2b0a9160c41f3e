use anyhow::{anyhow, Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};

use super::Exporter;
use crate::config::TelegramSettings;
use crate::engine::ExportBatch;

/// Sends each selected frame with its caption to every configured chat via the
/// Bot API. Loud delivery only when the throttle asked for sound.
pub struct TelegramExporter {
    settings: TelegramSettings,
    client: Client,
}

impl TelegramExporter {
    pub fn new(settings: TelegramSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("build Telegram HTTP client")?;
        Ok(Self { settings, client })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.bot_token,
            method
        )
    }

    /// Calls `getMe` to confirm the token works.
    pub fn check_connection(&self) -> Result<()> {
        check_response("getMe", self.client.get(self.method_url("getMe")).send())?;
        log::info!("telegram: bot token verified");
        Ok(())
    }

    fn send_photo(&self, chat_id: &str, jpeg: Vec<u8>, caption: &str, silent: bool) -> Result<()> {
        let photo = Part::bytes(jpeg)
            .file_name("detection.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .text("disable_notification", if silent { "true" } else { "false" })
            .part("photo", photo);

        check_response(
            "sendPhoto",
            self.client
                .post(self.method_url("sendPhoto"))
                .multipart(form)
                .send(),
        )
    }
}

impl Exporter for TelegramExporter {
    fn name(&self) -> &str {
        "telegram"
    }

    fn export(&self, batch: &ExportBatch) -> Result<()> {
        let silent = !batch.play_sound();
        let mut failures = Vec::new();
        for frame in &batch.frames {
            let jpeg = frame.render(batch.annotated).encode_jpeg()?;
            let caption = batch.caption(frame);
            for chat_id in &self.settings.chat_ids {
                if let Err(e) = self.send_photo(chat_id, jpeg.clone(), &caption, silent) {
                    failures.push(format!("chat {} ({}): {:#}", chat_id, frame.stage, e));
                }
            }
        }
        if failures.is_empty() {
            log::debug!(
                "telegram: sent {} photo(s) for {} {}",
                batch.frames.len(),
                batch.source,
                if silent { "silently" } else { "with sound" }
            );
            Ok(())
        } else {
            Err(anyhow!("{}", failures.join("; ")))
        }
    }

    fn notify_operator(&self, message: &str) -> Result<()> {
        for chat_id in &self.settings.chat_ids {
            check_response(
                "sendMessage",
                self.client
                    .post(self.method_url("sendMessage"))
                    .form(&[("chat_id", chat_id.as_str()), ("text", message)])
                    .send(),
            )?;
        }
        Ok(())
    }
}

/// Turn transport errors and non-2xx replies into errors that never carry the
/// bot token from the request URL.
fn check_response(method: &str, result: reqwest::Result<Response>) -> Result<()> {
    let response = result.map_err(|e| anyhow!("{} failed: {}", method, e.without_url()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().unwrap_or_default();
    Err(anyhow!(
        "{} returned HTTP {}: {}",
        method,
        status.as_u16(),
        body.trim()
    ))
}
