use crate::config::MailConfig;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Outbound email, the external delivery arm of the alerter. With email
/// disabled every send is logged instead.
#[derive(Clone)]
pub struct Mailer {
    config: MailConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl Mailer {
    pub fn new(config: MailConfig) -> Self {
        let transport = if config.enable {
            match build_transport(&config) {
                Some(transport) => {
                    tracing::info!("SMTP transport configured");
                    Some(transport)
                }
                None => {
                    tracing::warn!("email enabled but SMTP host missing or invalid");
                    None
                }
            }
        } else {
            None
        };
        Self { config, transport }
    }

    pub async fn send_user(&self, subject: &str, body: &str) {
        self.send(subject, body, &self.config.user).await;
    }

    pub async fn send_admin(&self, subject: &str, body: &str) {
        self.send(subject, body, &self.config.admin).await;
    }

    async fn send(&self, subject: &str, body: &str, to: &str) {
        let Some(transport) = &self.transport else {
            tracing::info!(%subject, %to, "email disabled");
            return;
        };
        let Ok(from) = self.config.source.parse::<Mailbox>() else {
            tracing::error!(source = %self.config.source, "invalid source address");
            return;
        };
        let Ok(to_addr) = to.parse::<Mailbox>() else {
            tracing::error!(%to, "invalid recipient address");
            return;
        };
        let message = match Message::builder()
            .from(from)
            .to(to_addr)
            .subject(format!("[Sensor] {subject}"))
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
        {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(error = %err, "failed to build email");
                return;
            }
        };
        if let Err(err) = transport.send(message).await {
            tracing::error!(error = %err, %to, "send email failed");
        }
    }
}

fn build_transport(config: &MailConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let host = config.smtp_host.as_deref()?;
    let builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).ok()?;
    Some(builder.port(config.smtp_port).build())
}
