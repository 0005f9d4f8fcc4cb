//! One-time preview tokens. Only the SHA-256 of a token ever touches disk;
//! the plaintext is returned once and never stored.

use rand::RngCore;
use rusqlite::OptionalExtension;

use crew_audit::AuditOutcome;
use crew_money::sha256_hex;
use crew_store::Session;
use crew_store::now_rfc3339;

use crate::InvoiceError;
use crate::InvoiceResult;
use crate::RenderedInvoice;

/// Mints a fresh preview token for the invoice, invalidating any previous
/// one, and returns the plaintext exactly once.
pub fn issue(session: &mut Session, actor: &str, invoice_id: i64) -> InvoiceResult<String> {
    crate::get(session.conn(), invoice_id)?;

    let mut bytes = [0_u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    let token_hash = sha256_hex(token.as_bytes());

    session.conn().execute(
        "DELETE FROM invoice_preview_tokens WHERE invoice_id = ?1",
        [invoice_id],
    )?;
    session.conn().execute(
        "INSERT INTO invoice_preview_tokens (token_hash, invoice_id, issued_at)
         VALUES (?1, ?2, ?3)",
        rusqlite::params![token_hash, invoice_id, now_rfc3339()],
    )?;
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "invoice.preview_issue",
        "invoice",
        Some(invoice_id),
        &serde_json::json!({"invoice_id": invoice_id}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "invoice.preview.issue",
        serde_json::json!({"invoice_id": invoice_id}),
    );
    Ok(token)
}

/// Redeems a token: hash must match an unused record for this invoice.
/// The consume is atomic; a second fetch with the same token is `gone`.
pub fn fetch(
    session: &mut Session,
    invoice_id: i64,
    token: &str,
) -> InvoiceResult<RenderedInvoice> {
    let token_hash = sha256_hex(token.as_bytes());
    let known: Option<Option<String>> = session
        .conn()
        .query_row(
            "SELECT used_at FROM invoice_preview_tokens
             WHERE token_hash = ?1 AND invoice_id = ?2",
            rusqlite::params![token_hash, invoice_id],
            |row| row.get(0),
        )
        .optional()?;
    match known {
        None => {
            return Err(InvoiceError::NotFound(format!(
                "preview token for invoice {invoice_id}"
            )));
        }
        Some(Some(_)) => return Err(InvoiceError::Gone),
        Some(None) => {}
    }

    let consumed = session.conn().execute(
        "UPDATE invoice_preview_tokens SET used_at = ?3
         WHERE token_hash = ?1 AND invoice_id = ?2 AND used_at IS NULL",
        rusqlite::params![token_hash, invoice_id, now_rfc3339()],
    )?;
    if consumed == 0 {
        return Err(InvoiceError::Gone);
    }
    session.mark_mutation()?;
    crew_audit::append(
        session,
        "preview-token",
        "invoice.preview_fetch",
        "invoice",
        Some(invoice_id),
        &serde_json::json!({"invoice_id": invoice_id}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "invoice.preview.fetch",
        serde_json::json!({"invoice_id": invoice_id}),
    );
    crate::render(session.conn(), invoice_id)
}
