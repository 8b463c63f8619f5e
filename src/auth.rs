//! One-shot login handshake run before a session exists

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::SecureChannel;
use crate::credentials::CredentialStore;
use crate::error::{AuthError, FrameError};
use crate::message::{Request, ServerMessage};

/// Read one login envelope, check it against `store`, reply with the verdict.
///
/// Returns the authenticated username. Any failure leaves the channel for
/// the caller to close; there is no retry on this side.
pub async fn authenticate(
    channel: &mut SecureChannel,
    store: &dyn CredentialStore,
    wait: Duration,
) -> Result<String, AuthError> {
    let peer = channel.peer();
    let env = match timeout(wait, channel.read_envelope()).await {
        Ok(Ok(env)) => env,
        Ok(Err(e)) => {
            if matches!(e, FrameError::MalformedEnvelope(_) | FrameError::FrameTooLarge { .. }) {
                debug!(%peer, error = %e, "unreadable login frame");
                reject(channel).await;
            }
            return Err(e.into());
        }
        Err(_) => {
            warn!(%peer, "login timed out");
            return Err(AuthError::Timeout(wait.as_secs()));
        }
    };

    let (username, password) = match Request::parse(&env) {
        Ok(Request::Login { username, password }) => (username, password),
        Ok(other) => {
            debug!(%peer, ?other, "first frame was not a login");
            reject(channel).await;
            return Err(AuthError::Rejected("expected a login frame".into()));
        }
        Err(e) => {
            debug!(%peer, error = %e, "unreadable login frame");
            reject(channel).await;
            return Err(AuthError::Rejected(e.to_string()));
        }
    };

    if !store.verify(&username, &password) {
        warn!(%peer, user = %username, "failed authentication");
        reject(channel).await;
        return Err(AuthError::Rejected(format!("bad credentials for {username}")));
    }

    channel
        .send_envelope(&ServerMessage::LoginResult(true).into_envelope())
        .await?;
    info!(%peer, user = %username, "authenticated");
    Ok(username)
}

async fn reject(channel: &SecureChannel) {
    if let Err(e) = channel
        .send_envelope(&ServerMessage::LoginResult(false).into_envelope())
        .await
    {
        debug!(peer = %channel.peer(), error = %e, "could not deliver login rejection");
    }
}
