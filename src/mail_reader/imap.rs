use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{AsyncRead, AsyncWrite, TryStreamExt};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::error::MailboxError;
use crate::mail_reader::encryption;
use crate::mail_reader::{Mailbox, MailboxConnect, RawMessage};
use crate::models::Account;
use log::{info, warn};

/// Production connector: TLS (or plain TCP) + LOGIN via async-imap.
pub struct ImapConnector;

pub struct ImapMailbox<S>
where
    S: AsyncRead + AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    session: Session<S>,
    username: String,
}

fn connect_error(e: impl std::fmt::Display) -> MailboxError {
    MailboxError::Connect(e.to_string())
}

fn protocol_error(e: impl std::fmt::Display) -> MailboxError {
    MailboxError::Protocol(e.to_string())
}

#[async_trait]
impl MailboxConnect for ImapConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn Mailbox>, MailboxError> {
        let password = encryption::decrypt_password(&account.password)
            .map_err(|e| MailboxError::Auth(format!("cannot decrypt stored password: {}", e)))?;

        let imap_addr = (account.host.as_str(), account.port);
        let tcp_stream = TcpStream::connect(imap_addr).await.map_err(connect_error)?;

        if account.use_tls {
            let tls = tokio_native_tls::TlsConnector::from(
                native_tls::TlsConnector::new().map_err(connect_error)?,
            );
            let tls_stream = tls
                .connect(&account.host, tcp_stream)
                .await
                .map_err(connect_error)?;
            info!("-- connected to {}:{}", account.host, account.port);

            let client = Client::new(tls_stream.compat());
            let session = login_to_server(client, &account.email, &password).await?;
            Ok(Box::new(ImapMailbox {
                session,
                username: account.email.clone(),
            }))
        } else {
            info!("-- connected to {}:{} (plain)", account.host, account.port);
            let client = Client::new(tcp_stream.compat());
            let session = login_to_server(client, &account.email, &password).await?;
            Ok(Box::new(ImapMailbox {
                session,
                username: account.email.clone(),
            }))
        }
    }
}

// Login to the IMAP server and return an authenticated session
async fn login_to_server<S>(
    client: Client<S>,
    username: &str,
    password: &str,
) -> Result<Session<S>, MailboxError>
where
    S: AsyncRead + AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    let imap_session = client
        .login(username, password)
        .await
        .map_err(|e| MailboxError::Auth(e.0.to_string()))?;

    info!("-- logged in as {}", username);
    Ok(imap_session)
}

#[async_trait]
impl<S> Mailbox for ImapMailbox<S>
where
    S: AsyncRead + AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    async fn list_folders(&mut self) -> Result<Vec<String>, MailboxError> {
        let stream = self
            .session
            .list(None, Some("*"))
            .await
            .map_err(protocol_error)?;
        let names: Vec<_> = stream.try_collect().await.map_err(protocol_error)?;
        Ok(names.iter().map(|n| n.name().to_string()).collect())
    }

    async fn fetch_since(
        &mut self,
        folder: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, MailboxError> {
        self.session.select(folder).await.map_err(protocol_error)?;
        info!("-- {} selected", folder);

        // SEARCH SINCE has day granularity; the gate dedups any overlap
        let query = format!("SINCE {}", since.format("%d-%b-%Y"));
        let uids = self
            .session
            .uid_search(&query)
            .await
            .map_err(protocol_error)?;

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();

        let mut messages = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(50) {
            let uid_set = chunk
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(",");

            let stream = self
                .session
                .uid_fetch(&uid_set, "(UID FLAGS INTERNALDATE BODY.PEEK[])")
                .await
                .map_err(protocol_error)?;
            let fetches: Vec<_> = stream.try_collect().await.map_err(protocol_error)?;

            for fetch in &fetches {
                match raw_message(fetch) {
                    Some(raw) => messages.push(raw),
                    None => warn!("skipping fetch response without UID or body in {}", folder),
                }
            }
        }

        Ok(messages)
    }

    async fn close(&mut self) {
        // Be nice to the server and log out
        if let Err(e) = self.session.logout().await {
            warn!("logout failed for {}: {}", self.username, e);
        }
    }
}

fn raw_message(fetch: &Fetch) -> Option<RawMessage> {
    let uid = fetch.uid?;
    let body = fetch.body()?;

    let flags: Vec<String> = fetch
        .flags()
        .filter_map(|f| match f {
            Flag::Seen => Some("\\Seen".to_string()),
            Flag::Answered => Some("\\Answered".to_string()),
            Flag::Flagged => Some("\\Flagged".to_string()),
            Flag::Deleted => Some("\\Deleted".to_string()),
            Flag::Draft => Some("\\Draft".to_string()),
            Flag::Recent => Some("\\Recent".to_string()),
            Flag::Custom(name) => Some(name.to_string()),
            _ => None,
        })
        .collect();

    Some(RawMessage {
        uid: uid.to_string(),
        flags,
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        body: body.to_vec(),
    })
}
