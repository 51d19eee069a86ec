use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use blobwire_config::ConfigMap;
use blobwire_endpoint::{AccessMode, Endpoint, SshMetadata};
use blobwire_http::{
    HttpClient, LfsRequest, MEDIA_TYPE, SshAuthResponse, SshCache, SshError, SshResolver,
    SshResult, TransportError,
};
use blobwire_telemetry::TransferMetrics;
use httpmock::prelude::*;
use reqwest::Method;
use url::Url;

fn client(pairs: &[(&str, &str)]) -> HttpClient {
    HttpClient::new(
        &ConfigMap::git_from_pairs(pairs.iter().copied()),
        &ConfigMap::environment(),
        None,
    )
}

fn get(url: &str) -> anyhow::Result<LfsRequest> {
    Ok(LfsRequest::new(Method::GET, Url::parse(url)?))
}

fn ssh_endpoint(url: &str) -> Endpoint {
    let mut endpoint = Endpoint::from_url(url);
    endpoint.ssh = SshMetadata {
        user_and_host: "git@git.example.com".to_string(),
        port: None,
        path: "org/repo".to_string(),
    };
    endpoint
}

struct FakeResolver {
    href: String,
    calls: AtomicUsize,
    failures: usize,
    expires_in: i64,
}

impl FakeResolver {
    fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            calls: AtomicUsize::new(0),
            failures: 0,
            expires_in: 3600,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshResolver for FakeResolver {
    async fn resolve(&self, _endpoint: &Endpoint, _method: &str) -> SshResult<SshAuthResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(SshError::Command {
                program: "ssh".to_string(),
                code: Some(255),
                message: "connection refused".to_string(),
            });
        }
        let mut header = BTreeMap::new();
        header.insert("Authorization".to_string(), "RemoteAuth token".to_string());
        Ok(SshAuthResponse {
            href: self.href.clone(),
            header,
            expires_in: self.expires_in,
            ..SshAuthResponse::default()
        })
    }
}

#[tokio::test]
async fn same_host_redirect_keeps_authorization() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    let moved = server.mock(|when, then| {
        when.method(GET).path("/old");
        then.status(307).header("Location", "/new");
    });
    let target = server.mock(|when, then| {
        when.method(GET)
            .path("/new")
            .header("authorization", "Basic dXNlcjpwYXNz");
        then.status(200).body("ok");
    });

    let mut request = get(&server.url("/old"))?;
    request.set_header("Authorization", "Basic dXNlcjpwYXNz")?;
    let response = client(&[]).do_request(request).await?;
    assert_eq!(response.text().await?, "ok");
    moved.assert();
    target.assert();
    Ok(())
}

#[tokio::test]
async fn cross_host_redirect_drops_authorization() -> anyhow::Result<()> {
    let origin = MockServer::start_async().await;
    let other = MockServer::start_async().await;
    let location = other.url("/objects");
    origin.mock(|when, then| {
        when.method(POST).path("/batch");
        then.status(307).header("Location", location.as_str());
    });
    let target = other.mock(|when, then| {
        when.method(POST)
            .path("/objects")
            .header_missing("authorization")
            .body("{}");
        then.status(200);
    });

    let metrics = TransferMetrics::new()?;
    let client = HttpClient::new(
        &ConfigMap::git_from_pairs(std::iter::empty::<(&str, &str)>()),
        &ConfigMap::environment(),
        Some(metrics.clone()),
    );
    let mut request = LfsRequest::new(Method::POST, Url::parse(&origin.url("/batch"))?)
        .with_body(b"{}".to_vec());
    request.set_header("Authorization", "Basic dXNlcjpwYXNz")?;
    client.do_request(request).await?;
    target.assert();
    assert_eq!(metrics.snapshot().redirects_total, 1);
    Ok(())
}

#[tokio::test]
async fn third_redirect_in_a_chain_fails() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    let looping = server.mock(|when, then| {
        when.method(GET).path("/loop");
        then.status(302).header("Location", "/loop");
    });

    let err = client(&[])
        .do_request(get(&server.url("/loop"))?)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected redirect failure"))?;
    assert!(matches!(err, TransportError::TooManyRedirects { .. }));
    looping.assert_calls(3);
    Ok(())
}

#[tokio::test]
async fn redirect_chains_follow_two_hops_only() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    for (from, to) in [("/a", "/b"), ("/b", "/c"), ("/c", "/d")] {
        server.mock(|when, then| {
            when.method(GET).path(from);
            then.status(307).header("Location", to);
        });
    }
    let landed_c = server.mock(|when, then| {
        when.method(GET).path("/c2");
        then.status(200);
    });
    let landed_d = server.mock(|when, then| {
        when.method(GET).path("/d");
        then.status(200);
    });
    server.mock(|when, then| {
        when.method(GET).path("/b2");
        then.status(302).header("Location", "/c2");
    });
    server.mock(|when, then| {
        when.method(GET).path("/a2");
        then.status(302).header("Location", "/b2");
    });

    let client = self::client(&[]);
    let response = client.do_request(get(&server.url("/a2"))?).await?;
    assert_eq!(response.status().as_u16(), 200);
    landed_c.assert();

    let result = client.do_request(get(&server.url("/a"))?).await;
    assert!(matches!(result, Err(TransportError::TooManyRedirects { .. })));
    landed_d.assert_calls(0);
    Ok(())
}

#[tokio::test]
async fn redirect_without_location_is_rejected() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/nowhere");
        then.status(301);
    });

    let result = client(&[]).do_request(get(&server.url("/nowhere"))?).await;
    assert!(matches!(result, Err(TransportError::InvalidRedirect { .. })));
    Ok(())
}

#[tokio::test]
async fn error_statuses_are_classified() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.path("/auth");
        then.status(401);
    });
    server.mock(|when, then| {
        when.path("/slow");
        then.status(429).header("Retry-After", "30");
    });
    server.mock(|when, then| {
        when.path("/broken");
        then.status(500)
            .header("Content-Type", MEDIA_TYPE)
            .body(r#"{"message":"storage offline","request_id":"abc"}"#);
    });
    let client = client(&[]);

    let auth = client.do_request(get(&server.url("/auth"))?).await;
    assert!(auth.as_ref().is_err_and(TransportError::is_auth_error));

    let slow = client
        .do_request(get(&server.url("/slow"))?)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected 429"))?;
    assert!(slow.is_retriable());
    assert!(slow.retry_after().is_some());

    let broken = client
        .do_request(get(&server.url("/broken"))?)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected 500"))?;
    assert!(broken.is_fatal());
    let rendered = broken.to_string();
    assert!(rendered.starts_with("storage offline"));
    assert!(rendered.contains("Request ID: abc"));
    Ok(())
}

#[tokio::test]
async fn extra_headers_are_added_by_do_request() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    let base = server.base_url();
    let key = format!("http.{base}.extraheader");
    let tagged = server.mock(|when, then| {
        when.path("/info").header("x-trace", "blobwire");
        then.status(200);
    });

    let client = client(&[(key.as_str(), "X-Trace: blobwire"), (key.as_str(), "garbage")]);
    client.do_request(get(&server.url("/info"))?).await?;
    tagged.assert();
    Ok(())
}

#[tokio::test]
async fn transport_failures_use_the_request_budget() -> anyhow::Result<()> {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };
    let metrics = TransferMetrics::new()?;
    let client = HttpClient::new(
        &ConfigMap::git_from_pairs(std::iter::empty::<(&str, &str)>()),
        &ConfigMap::environment(),
        Some(metrics.clone()),
    );

    let request = get(&format!("http://127.0.0.1:{port}/down"))?.with_retries(2);
    let result = client.do_with_access(request, AccessMode::Basic).await;
    assert!(matches!(result, Err(TransportError::Send { .. })));
    assert_eq!(metrics.snapshot().transport_retries_total, 2);
    Ok(())
}

#[tokio::test]
async fn ssh_href_and_headers_shape_new_requests() -> anyhow::Result<()> {
    let resolver = Arc::new(FakeResolver::new("https://lfs.example.com/org/repo/"));
    let client = client(&[]).with_ssh_resolver(resolver.clone());
    let endpoint = ssh_endpoint("https://git.example.com/org/repo.git/info/lfs");

    let request = client
        .new_request(Method::POST, &endpoint, "objects/batch")
        .await?;
    assert_eq!(
        request.url().as_str(),
        "https://lfs.example.com/org/repo/objects/batch"
    );
    assert_eq!(request.header("authorization"), Some("RemoteAuth token"));
    assert_eq!(request.header("accept"), Some(MEDIA_TYPE));
    assert_eq!(resolver.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn new_request_requires_http_urls() -> anyhow::Result<()> {
    let client = client(&[]);
    let err = client
        .new_request(Method::GET, &Endpoint::from_url("ftp://host/repo?token=s3cret"), "locks")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected missing protocol"))?;
    assert!(matches!(err, TransportError::MissingProtocol { .. }));
    assert!(!err.to_string().contains("s3cret"));

    let request = client
        .new_request(Method::GET, &Endpoint::from_url("https://host/repo/info/lfs/"), "/locks")
        .await?;
    assert_eq!(request.url().as_str(), "https://host/repo/info/lfs/locks");
    Ok(())
}

#[tokio::test]
async fn ssh_resolution_is_retried() -> anyhow::Result<()> {
    let resolver = Arc::new(FakeResolver {
        failures: 2,
        ..FakeResolver::new("https://lfs.example.com/repo")
    });
    let endpoint = ssh_endpoint("https://git.example.com/repo");

    let client = client(&[("lfs.ssh.retries", "2")]).with_ssh_resolver(resolver.clone());
    client.new_request(Method::GET, &endpoint, "locks").await?;
    assert_eq!(resolver.calls(), 3);

    let resolver = Arc::new(FakeResolver {
        failures: 10,
        ..FakeResolver::new("https://lfs.example.com/repo")
    });
    let client = self::client(&[("lfs.ssh.retries", "1")]).with_ssh_resolver(resolver.clone());
    let result = client.new_request(Method::GET, &endpoint, "locks").await;
    assert!(matches!(result, Err(TransportError::Ssh { .. })));
    assert_eq!(resolver.calls(), 2);
    Ok(())
}

#[tokio::test]
async fn cached_ssh_tokens_are_reused_until_expiry() -> anyhow::Result<()> {
    let endpoint = ssh_endpoint("https://git.example.com/repo");

    let fresh = Arc::new(FakeResolver::new("https://lfs.example.com/repo"));
    let cache = Arc::new(SshCache::new(fresh.clone(), None));
    let client = client(&[]).with_ssh_resolver(cache);
    client.new_request(Method::GET, &endpoint, "locks").await?;
    client.new_request(Method::GET, &endpoint, "locks").await?;
    assert_eq!(fresh.calls(), 1);

    let expired = Arc::new(FakeResolver {
        expires_in: -1,
        ..FakeResolver::new("https://lfs.example.com/repo")
    });
    let cache = Arc::new(SshCache::new(expired.clone(), None));
    let client = self::client(&[]).with_ssh_resolver(cache);
    client.new_request(Method::GET, &endpoint, "locks").await?;
    client.new_request(Method::GET, &endpoint, "locks").await?;
    assert_eq!(expired.calls(), 2);
    Ok(())
}
