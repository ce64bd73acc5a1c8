use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, RequestBuilder};
use sha1::Sha1;
use snafu::ResultExt;

use super::{BuildClientSnafu, Error, UpyunConfig};

type HmacSha1 = Hmac<Sha1>;

/// Issues requests signed with the operator's credentials.
pub struct SigningClient {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    operator: String,
    /// md5 hex digest of the operator password.
    key: String,
}

impl std::fmt::Debug for SigningClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningClient")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("operator", &self.operator)
            .finish()
    }
}

impl SigningClient {
    pub fn new(config: &UpyunConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .build()
            .context(BuildClientSnafu)?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            operator: config.operator.clone(),
            key: format!("{:x}", md5::compute(config.password.as_bytes())),
        })
    }

    /// Path part of the request URL for `dest`.
    pub fn uri(&self, dest: &str) -> String {
        if dest.starts_with('/') {
            format!("/{}{}", self.bucket, dest)
        } else {
            format!("/{}/{}", self.bucket, dest)
        }
    }

    pub fn request(&self, method: Method, dest: &str) -> RequestBuilder {
        let uri = self.uri(dest);
        let date = http_date(Utc::now());
        let signature = signature(&self.key, &method, &uri, &date);

        self.http
            .request(method, format!("{}{}", self.endpoint, uri))
            .header("Authorization", format!("UPYUN {}:{}", self.operator, signature))
            .header("Date", date)
    }
}

/// RFC 1123 date as used by the `Date` header.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// base64(HMAC-SHA1(key, "METHOD&URI&DATE"))
pub fn signature(key: &str, method: &Method, uri: &str, date: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{}&{}&{}", method.as_str(), uri, date).as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}
