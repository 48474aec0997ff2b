//! Option Transformer: a pure function translating a canonical request into
//! a backend-specific invocation.

use crate::model::{BackendId, CanonicalRequest, FileMode};
use crate::registry::BackendRegistry;

/// `transform(request, targetId) -> request`.
///
/// Never inspects `request.prompt` beyond prepending the files banner.
/// This is what makes the transformer idempotent: a request whose
/// attachments were already folded into the prompt on a prior hop carries
/// an empty `attachments` list, so a later call is a pure pass-through of
/// `backendId`.
pub fn transform(
    request: &CanonicalRequest,
    target_id: &BackendId,
    registry: &BackendRegistry,
) -> CanonicalRequest {
    let mut next = request.clone();
    next.backend_id = Some(target_id.clone());

    if next.attachments.is_empty() {
        return next;
    }

    let Some(descriptor) = registry.get(target_id) else {
        // Unknown target: leave the request otherwise untouched. The
        // caller resolves `UnknownBackend` before the request ever reaches
        // the executor.
        return next;
    };

    match descriptor.capabilities.file_mode {
        FileMode::CliFlag => {
            // attachments pass through unchanged
        }
        FileMode::EmbedInPrompt | FileMode::None => {
            if descriptor.capabilities.file_mode == FileMode::None {
                tracing::warn!(backend = %target_id, "target backend has no file support; embedding attachments in prompt anyway");
            }
            let banner = format!("[Files to analyze: {}]\n\n", next.attachments.join(", "));
            next.prompt = format!("{banner}{}", next.prompt);
            next.attachments.clear();
        }
    }

    next
}
