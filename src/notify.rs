//! Notification dispatch. The mail provider is an external collaborator;
//! this module owns the message shape and logs the dispatch. Delivery
//! failures must never fail the request that triggered them.

use tracing::info;

/// Dispatch a password-reset link to the given address.
///
/// TODO: wire a real transactional-mail provider behind this once the
/// MAIL_API_KEY secret is provisioned; until then the reset link is only
/// traced so local flows stay testable.
pub async fn send_password_reset(email: &str, token: &str) {
    let reset_link = format!("/api/auth/reset-password?token={token}");
    info!(
        to = %email,
        link = %reset_link,
        "password reset email dispatched"
    );
}
