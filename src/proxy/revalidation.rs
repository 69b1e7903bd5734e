use http::Method;

use super::request::ClientRequest;
use super::response::HttpResponse;

/// Build a conditional request that revalidates a stored response at the
/// origin (RFC 7232). Returns `None` when the stored response carries no
/// validator, in which case it cannot be revalidated and must be refetched.
pub fn build_revalidation_request(
    request: &ClientRequest,
    stored: &HttpResponse,
) -> Option<ClientRequest> {
    let mut conditional = request.clone();
    let mut can_validate = false;

    if let Some(etag) = stored.headers.get(http::header::ETAG) {
        conditional
            .headers
            .insert(http::header::IF_NONE_MATCH, etag.clone());
        can_validate = true;
    }

    // If-Modified-Since is only defined for GET and HEAD (RFC 7232 §3.3).
    if (request.method == Method::GET || request.method == Method::HEAD)
        && let Some(last_modified) = stored.headers.get(http::header::LAST_MODIFIED)
    {
        conditional
            .headers
            .insert(http::header::IF_MODIFIED_SINCE, last_modified.clone());
        can_validate = true;
    }

    can_validate.then_some(conditional)
}
