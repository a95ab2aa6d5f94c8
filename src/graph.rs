use log::{debug, info, trace};
use serde::Serialize;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::error::{ConfigError, DeliveryError};
use crate::mail::{Attachment, DecodedMessage};

const FILE_ATTACHMENT: &str = "#microsoft.graph.fileAttachment";

#[derive(Serialize)]
pub struct GraphEmailAddress {
    pub address: String
}

#[derive(Serialize)]
pub struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    pub email_address: GraphEmailAddress
}

#[derive(Serialize)]
pub struct GraphItemBody {
    #[serde(rename = "contentType")]
    pub content_type: &'static str,
    pub content: String
}

#[derive(Serialize)]
pub struct GraphFileAttachment {
    #[serde(rename = "@odata.type")]
    pub odata_type: &'static str,
    pub name: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    #[serde(rename = "contentBytes")]
    pub content_bytes: String
}

#[derive(Serialize)]
pub struct GraphMessage {
    pub subject: String,
    pub body: GraphItemBody,
    #[serde(rename = "toRecipients")]
    pub to_recipients: Vec<GraphRecipient>,
    pub from: GraphRecipient,
    pub attachments: Vec<GraphFileAttachment>
}

#[derive(Serialize)]
pub struct SendMailRequest {
    pub message: GraphMessage,
    #[serde(rename = "saveToSentItems")]
    pub save_to_sent_items: bool
}

/// One SMTP transaction, ready to hand to the mail API.
pub struct Submission<'a> {
    /// Mailbox the token was issued for; the message is sent as this user.
    pub account: &'a str,
    pub from: &'a str,
    pub recipients: &'a [String],
    pub message: &'a DecodedMessage
}

/// Delivers a finished transaction.
pub trait MailSubmitter: Send + Sync {
    fn submit(&self, token: &str, submission: &Submission) -> Result<(), DeliveryError>;
}

impl GraphRecipient {
    pub fn new(address: &str) -> Self {
        Self {
            email_address: GraphEmailAddress { address: address.to_string() }
        }
    }
}

impl GraphFileAttachment {
    pub fn new(attachment: &Attachment) -> Self {
        Self {
            odata_type: FILE_ATTACHMENT,
            name: attachment.filename.clone(),
            content_type: attachment.content_type.clone(),
            content_bytes: STANDARD.encode(&attachment.content)
        }
    }
}

impl SendMailRequest {
    pub fn new(submission: &Submission, save_to_sent_items: bool) -> Self {
        let message = submission.message;

        let content_type = match message.is_html {
            true => "html",
            false => "text"
        };

        Self {
            message: GraphMessage {
                subject: message.subject.clone(),
                body: GraphItemBody {
                    content_type,
                    content: message.body.clone()
                },
                to_recipients: submission.recipients.iter().map(|r| GraphRecipient::new(r)).collect(),
                from: GraphRecipient::new(submission.from),
                attachments: message.attachments.iter().map(GraphFileAttachment::new).collect()
            },
            save_to_sent_items
        }
    }
}

pub struct GraphClient {
    http: Client,
    endpoint: Url,
    save_to_sent: bool
}

impl GraphClient {

    pub fn new(http: Client, endpoint: Url, save_to_sent: bool) -> Result<Self, ConfigError> {
        if endpoint.cannot_be_a_base() {
            return Err(ConfigError::Invalid(format!("Graph endpoint {endpoint} cannot take a path")));
        }

        Ok(Self {
            http,
            endpoint,
            save_to_sent
        })
    }

    fn send_mail_url(&self, account: &str) -> Url {
        let mut url = self.endpoint.clone();

        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(&["users", account, "sendMail"]);
        }

        url
    }

}

impl MailSubmitter for GraphClient {

    fn submit(&self, token: &str, submission: &Submission) -> Result<(), DeliveryError> {
        let url = self.send_mail_url(submission.account);
        let body = serde_json::to_string(&SendMailRequest::new(submission, self.save_to_sent))?;
        let request_id = uuid::Uuid::new_v4().to_string();

        info!("URL: {url} client-request-id: {request_id}");
        trace!("Content: {body}");

        let res = self.http
            .post(url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json")
            .header("client-request-id", &request_id)
            .body(body)
            .send()?;

        let status = res.status();

        if !status.is_success() {
            let body = res.text().unwrap_or_default();
            return Err(DeliveryError::Rejected { status, body });
        }

        debug!("Send Status: {status}");

        Ok(())
    }

}
