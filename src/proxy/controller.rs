use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use http::StatusCode;
use time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, warn};

use super::cache_control::{self, directives};
use super::cacheability::{response_age, response_ttl, should_store_response};
use super::config::{CacheConfig, ForwardConfig};
use super::forward::{self, Transport};
use super::key;
use super::layer::{EntryReader, StorageCascade};
use super::request::ClientRequest;
use super::response::HttpResponse;
use super::revalidation::build_revalidation_request;

/// Resolve a per-request cache policy. `None` selects the default config.
pub trait CacheConfigResolver: Send + Sync {
    fn cache_config(&self, request: &ClientRequest) -> Option<Arc<CacheConfig>>;
}

/// Resolve the origin a request is forwarded to. `None` selects the default.
pub trait ForwardConfigResolver: Send + Sync {
    fn forward_config(&self, request: &ClientRequest) -> Option<Arc<ForwardConfig>>;
}

/// Resolve the transport used to reach the origin. `None` selects the
/// default.
pub trait TransportResolver: Send + Sync {
    fn transport(&self, request: &ClientRequest) -> Option<Arc<dyn Transport>>;
}

/// How a request was satisfied, for access logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDisposition {
    Hit,
    Miss,
    Revalidated,
    Stale,
    Bypass,
    Error,
}

impl CacheDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheDisposition::Hit => "HIT",
            CacheDisposition::Miss => "MISS",
            CacheDisposition::Revalidated => "REVALIDATED",
            CacheDisposition::Stale => "STALE",
            CacheDisposition::Bypass => "BYPASS",
            CacheDisposition::Error => "ERROR",
        }
    }
}

/// The shared-cache request handler: looks up stored responses, decides
/// freshness against client directives, revalidates or refetches at the
/// origin, invalidates on unsafe methods, and stores what RFC 7234 permits.
pub struct CacheController {
    default_cache_config: Arc<CacheConfig>,
    default_forward_config: Option<Arc<ForwardConfig>>,
    default_transport: Arc<dyn Transport>,
    cache_config_resolver: Option<Arc<dyn CacheConfigResolver>>,
    forward_config_resolver: Option<Arc<dyn ForwardConfigResolver>>,
    transport_resolver: Option<Arc<dyn TransportResolver>>,
    cascade: StorageCascade,
}

enum CachedOutcome {
    /// Final response; bypasses post-processing.
    Serve(HttpResponse, CacheDisposition),
    /// Revalidation produced a representation to post-process and store.
    Validated(HttpResponse),
    /// The stored entry is unusable; fetch from the origin.
    Refetch,
}

impl CacheController {
    pub fn new(cascade: StorageCascade, transport: Arc<dyn Transport>) -> Self {
        Self {
            default_cache_config: Arc::new(CacheConfig::default()),
            default_forward_config: None,
            default_transport: transport,
            cache_config_resolver: None,
            forward_config_resolver: None,
            transport_resolver: None,
            cascade,
        }
    }

    pub fn with_cache_config(mut self, config: Arc<CacheConfig>) -> Self {
        self.default_cache_config = config;
        self
    }

    pub fn with_forward_config(mut self, forward: Arc<ForwardConfig>) -> Self {
        self.default_forward_config = Some(forward);
        self
    }

    pub fn with_cache_config_resolver(mut self, resolver: Arc<dyn CacheConfigResolver>) -> Self {
        self.cache_config_resolver = Some(resolver);
        self
    }

    pub fn with_forward_config_resolver(
        mut self,
        resolver: Arc<dyn ForwardConfigResolver>,
    ) -> Self {
        self.forward_config_resolver = Some(resolver);
        self
    }

    pub fn with_transport_resolver(mut self, resolver: Arc<dyn TransportResolver>) -> Self {
        self.transport_resolver = Some(resolver);
        self
    }

    /// Handle one client request to completion. Never fails: every error
    /// path degrades to a well-formed HTTP response.
    pub async fn handle(&self, request: &ClientRequest) -> (HttpResponse, CacheDisposition) {
        let config = self
            .cache_config_resolver
            .as_ref()
            .and_then(|resolver| resolver.cache_config(request))
            .unwrap_or_else(|| self.default_cache_config.clone());

        let forward_config = self
            .forward_config_resolver
            .as_ref()
            .and_then(|resolver| resolver.forward_config(request))
            .or_else(|| self.default_forward_config.clone());
        let Some(forward_config) = forward_config else {
            return (
                HttpResponse::text(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "no forward configuration for request",
                ),
                CacheDisposition::Error,
            );
        };

        let transport = self
            .transport_resolver
            .as_ref()
            .and_then(|resolver| resolver.transport(request))
            .unwrap_or_else(|| self.default_transport.clone());

        let primary = key::primary_key(request, &forward_config);

        // Only safe, cacheable methods can have been stored, so anything
        // else skips the lookup entirely.
        let lookup_allowed =
            config.is_method_safe(&request.method) && config.is_method_cacheable(&request.method);

        let mut disposition = CacheDisposition::Bypass;
        let mut response = None;

        if lookup_allowed {
            disposition = CacheDisposition::Miss;
            match self.lookup(&primary, request).await {
                Err(err) => {
                    error!(error = %err, cache_key = %primary, "error while searching the cache");
                    return (
                        HttpResponse::text(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "error while attempting to find cached response",
                        ),
                        CacheDisposition::Error,
                    );
                }
                Ok(None) => {}
                Ok(Some((cached, ttl))) => {
                    match self
                        .evaluate_cached(
                            request,
                            &config,
                            &forward_config,
                            transport.as_ref(),
                            cached,
                            ttl,
                        )
                        .await
                    {
                        CachedOutcome::Serve(served, disposition) => return (served, disposition),
                        CachedOutcome::Validated(validated) => {
                            disposition = CacheDisposition::Revalidated;
                            response = Some(validated);
                        }
                        CachedOutcome::Refetch => {}
                    }
                }
            }
        }

        let response = match response {
            Some(response) => response,
            None => match forward::forward(transport.as_ref(), request, &forward_config).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(
                        error = %err,
                        host = %forward_config.host,
                        "error while proxying request to origin server"
                    );
                    return (
                        HttpResponse::text(
                            StatusCode::BAD_GATEWAY,
                            "unable to contact origin server",
                        ),
                        CacheDisposition::Error,
                    );
                }
            },
        };

        self.post_process(request, &config, &forward_config, response, &primary, disposition)
            .await
    }

    /// Decide what to do with a stored response: serve it, revalidate it, or
    /// declare it unusable.
    async fn evaluate_cached(
        &self,
        request: &ClientRequest,
        config: &CacheConfig,
        forward_config: &ForwardConfig,
        transport: &dyn Transport,
        mut cached: HttpResponse,
        ttl: Duration,
    ) -> CachedOutcome {
        let request_directives = directives(&request.headers);
        let cached_directives = directives(&cached.headers);

        // Client directives move the freshness bar: max-stale lowers it
        // below zero, min-fresh raises it.
        let mut compare_ttl = Duration::ZERO;
        if let Some(tolerance) = cache_control::max_stale(&request_directives) {
            compare_ttl = match tolerance {
                Some(seconds) => -Duration::seconds(seconds),
                None => Duration::MIN,
            };
        }
        if let Some(seconds) = cache_control::directive_seconds(&request_directives, "min-fresh") {
            compare_ttl = Duration::seconds(seconds);
        }

        let age = response_age(&cached);
        let wanted = match cache_control::directive_seconds(&request_directives, "max-age") {
            Some(limit) => age <= Duration::seconds(limit),
            None => true,
        };

        let no_cache = cache_control::has_directive(&request_directives, "no-cache")
            || cache_control::has_directive(&cached_directives, "no-cache")
            || pragma_no_cache(request);
        let revalidate_required = cache_control::has_directive(&cached_directives, "must-revalidate")
            || cache_control::has_directive(&cached_directives, "proxy-revalidate");

        if ttl > compare_ttl && !no_cache && !revalidate_required && wanted {
            strip_no_cache_fields(&mut cached, &cached_directives);
            cached.set_age(age);
            return CachedOutcome::Serve(cached, CacheDisposition::Hit);
        }

        let Some(conditional) = build_revalidation_request(request, &cached) else {
            return CachedOutcome::Refetch;
        };

        match forward::forward(transport, &conditional, forward_config).await {
            Err(err) => {
                if config.serve_stale_on_error && stale_permitted(&cached_directives) {
                    warn!(error = %err, "origin unreachable during revalidation; serving stale response");
                    strip_no_cache_fields(&mut cached, &cached_directives);
                    cached.set_age(response_age(&cached));
                    return CachedOutcome::Serve(cached, CacheDisposition::Stale);
                }
                warn!(error = %err, "unable to revalidate cached response at origin server");
                CachedOutcome::Serve(
                    HttpResponse::text(
                        StatusCode::GATEWAY_TIMEOUT,
                        "unable to reach origin server while revalidating cache",
                    ),
                    CacheDisposition::Error,
                )
            }
            Ok(validation) if validation.status.as_u16() > 500 => {
                if config.serve_stale_on_error && stale_permitted(&cached_directives) {
                    warn!(
                        status = validation.status.as_u16(),
                        "origin error during revalidation; serving stale response"
                    );
                    strip_no_cache_fields(&mut cached, &cached_directives);
                    cached.set_age(response_age(&cached));
                    return CachedOutcome::Serve(cached, CacheDisposition::Stale);
                }
                // The origin answered; its error is surfaced as-is.
                CachedOutcome::Serve(validation, CacheDisposition::Error)
            }
            Ok(validation) if validation.status == StatusCode::NOT_MODIFIED => {
                merge_validated_headers(&mut cached, &validation);
                CachedOutcome::Validated(cached)
            }
            Ok(validation) if validation.status == StatusCode::OK => {
                CachedOutcome::Validated(validation)
            }
            Ok(_) => CachedOutcome::Refetch,
        }
    }

    /// Shared tail for origin-derived responses: default the `Date`, run
    /// invalidation for unsafe methods, store what is storable, and hand the
    /// normalized stored form to the client.
    async fn post_process(
        &self,
        request: &ClientRequest,
        config: &CacheConfig,
        forward_config: &ForwardConfig,
        mut response: HttpResponse,
        primary: &str,
        disposition: CacheDisposition,
    ) -> (HttpResponse, CacheDisposition) {
        // A proxy must make sure a Date header exists (RFC 7231 §7.1.1.2).
        if !response.headers.contains_key(http::header::DATE) {
            let now = httpdate::fmt_http_date(std::time::SystemTime::now());
            if let Ok(value) = http::HeaderValue::from_str(&now) {
                response.headers.insert(http::header::DATE, value);
            }
        }

        if !config.is_method_safe(&request.method)
            && (response.status.is_success() || response.status.is_redirection())
        {
            self.invalidate_affected(config, forward_config, request, &response)
                .await;
        }

        let mut served = response;
        if should_store_response(config, request, &served) {
            let ttl = response_ttl(config, &served);
            if ttl > Duration::ZERO {
                match self.store_response(primary, request, &served, ttl).await {
                    Ok(()) => match self.lookup(primary, request).await {
                        Ok(Some((stored, _ttl))) => served = stored,
                        Ok(None) => {
                            debug!(cache_key = %primary, "stored response evicted before re-read")
                        }
                        Err(err) => {
                            warn!(error = %err, cache_key = %primary, "failed to re-read stored response");
                        }
                    },
                    // Fail open: an uncacheable write still serves the client.
                    Err(err) => {
                        warn!(error = %err, cache_key = %primary, "failed to store response in cache");
                    }
                }
            }
        }

        if disposition == CacheDisposition::Revalidated {
            served.set_age(response_age(&served));
        }
        (served, disposition)
    }

    /// Compute the full cache key for this request and read the stored
    /// response under it, if any.
    async fn lookup(
        &self,
        primary: &str,
        request: &ClientRequest,
    ) -> Result<Option<(HttpResponse, Duration)>> {
        let fields = self.load_secondary_fields(primary).await?;
        let full_key = format!("{primary}{}", key::secondary_key(&fields, &request.headers));

        let Some(hit) = self.cascade.get(&full_key).await? else {
            return Ok(None);
        };
        let raw = read_entry(hit.reader).await?;
        let response = HttpResponse::from_wire(&raw)
            .with_context(|| format!("stored response under '{full_key}' is unreadable"))?;
        Ok(Some((response, hit.ttl)))
    }

    async fn load_secondary_fields(&self, primary: &str) -> Result<Vec<String>> {
        let Some(hit) = self.cascade.get(&key::secondary_list_key(primary)).await? else {
            return Ok(Vec::new());
        };
        let raw = read_entry(hit.reader).await?;
        let text = String::from_utf8_lossy(&raw);
        Ok(text
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Persist the secondary-key field list and the response's wire form.
    /// Serialization runs in its own producer task feeding a bounded pipe;
    /// producer and store are both joined before reporting.
    async fn store_response(
        &self,
        primary: &str,
        request: &ClientRequest,
        response: &HttpResponse,
        ttl: Duration,
    ) -> Result<()> {
        let fields = key::vary_fields(&response.headers);
        let list = Bytes::from(fields.join("\n"));
        self.cascade
            .set(
                &key::secondary_list_key(primary),
                Box::new(Cursor::new(list)),
                ttl,
            )
            .await?;

        let full_key = format!("{primary}{}", key::secondary_key(&fields, &request.headers));

        let (mut producer_end, consumer_end) = tokio::io::duplex(16 * 1024);
        let head = response.wire_head();
        let body = response.body.clone();
        let producer = tokio::spawn(async move {
            producer_end.write_all(&head).await?;
            producer_end.write_all(&body).await?;
            producer_end.shutdown().await?;
            Ok::<(), std::io::Error>(())
        });

        let store_result = self.cascade.set(&full_key, Box::new(consumer_end), ttl).await;
        let producer_result = producer
            .await
            .map_err(|err| anyhow!("cache serialization task failed: {err}"));

        store_result?;
        producer_result?.context("failed to serialize response for storage")?;
        Ok(())
    }

    /// A successful unsafe request invalidates every variant stored for the
    /// effective URI and for any URI named by `Location` or
    /// `Content-Location`, across all safe methods. Entries are forced
    /// stale with a negative refresh rather than deleted.
    async fn invalidate_affected(
        &self,
        config: &CacheConfig,
        forward_config: &ForwardConfig,
        request: &ClientRequest,
        response: &HttpResponse,
    ) {
        let base = key::effective_uri(request, forward_config);
        let mut targets = vec![base.clone()];
        for header in [http::header::LOCATION, http::header::CONTENT_LOCATION] {
            if let Some(value) = response.header_str(header)
                && let Some(resolved) = resolve_invalidation_target(&base, value)
                && !targets.contains(&resolved)
            {
                targets.push(resolved);
            }
        }

        for target in &targets {
            for method in &config.safe_methods {
                let primary = format!("{method}{target}");
                let fields = match self.load_secondary_fields(&primary).await {
                    Ok(fields) => fields,
                    Err(err) => {
                        warn!(error = %err, cache_key = %primary, "failed to load secondary keys during invalidation");
                        Vec::new()
                    }
                };
                let full_key =
                    format!("{primary}{}", key::secondary_key(&fields, &request.headers));
                self.cascade.refresh(&full_key, Duration::seconds(-1)).await;
                debug!(cache_key = %full_key, "invalidated cache entry");
            }
        }
    }
}

async fn read_entry(mut reader: EntryReader) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    reader
        .read_to_end(&mut raw)
        .await
        .context("failed to read cache entry")?;
    Ok(raw)
}

/// `Pragma: no-cache` counts only when no `Cache-Control` header is present
/// (RFC 7234 §5.4).
fn pragma_no_cache(request: &ClientRequest) -> bool {
    !request.headers.contains_key(http::header::CACHE_CONTROL)
        && request
            .headers
            .get(http::header::PRAGMA)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("no-cache"))
}

/// Headers named by a field-list `no-cache` must not be reused without
/// validation; serving without validation requires dropping them.
fn strip_no_cache_fields(response: &mut HttpResponse, response_directives: &[String]) {
    for field in cache_control::no_cache_fields(response_directives) {
        response.headers.remove(field.as_str());
    }
}

/// Whether a stored response may be served stale when the origin fails.
fn stale_permitted(response_directives: &[String]) -> bool {
    !(cache_control::has_directive(response_directives, "must-revalidate")
        || cache_control::has_directive(response_directives, "proxy-revalidate")
        || cache_control::has_directive(response_directives, "no-cache")
        || cache_control::has_directive_or_value(response_directives, "s-maxage"))
}

/// After a 304, the stored header set is overlaid with the validator's
/// headers; on a conflict the validator wins, untouched stored headers
/// survive.
fn merge_validated_headers(cached: &mut HttpResponse, validation: &HttpResponse) {
    for name in validation.headers.keys() {
        cached.headers.remove(name);
    }
    for (name, value) in validation.headers.iter() {
        cached.headers.append(name.clone(), value.clone());
    }
}

fn resolve_invalidation_target(base: &str, reference: &str) -> Option<String> {
    let base = url::Url::parse(base).ok()?;
    let resolved = base.join(reference).ok()?;
    Some(key::canonical_url(resolved))
}
