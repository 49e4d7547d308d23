use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::http::{build_client, ensure_success, normalize_base, timeout_secs};
use crate::webhook::UserDirectory;

const FEISHU_API_BASE: &str = "https://open.feishu.cn";

fn default_timeout() -> u64 {
    10
}

/**
 * \brief 飞书开放平台应用凭证。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeishuConfig {
    pub app_id: String,
    pub app_secret: String,
    /** \brief 开放平台地址，默认 https://open.feishu.cn */
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

/**
 * \brief 通过飞书通讯录接口解析用户显示名。
 */
pub struct FeishuDirectory {
    base_url: String,
    app_id: String,
    app_secret: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TenantTokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
}

#[derive(Deserialize)]
struct UserInfoResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<UserInfoData>,
}

#[derive(Deserialize)]
struct UserInfoData {
    user: UserInfo,
}

#[derive(Deserialize)]
struct UserInfo {
    name: String,
}

impl FeishuDirectory {
    pub fn new(config: &FeishuConfig) -> Result<Self> {
        if config.app_id.is_empty() || config.app_secret.is_empty() {
            return Err(Error::Config("feishu app_id/app_secret required".into()));
        }
        let timeout = timeout_secs(config.timeout_seconds);
        Ok(Self {
            base_url: normalize_base(&config.base_url, FEISHU_API_BASE),
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            timeout,
            http: build_client(timeout)?,
        })
    }

    async fn tenant_access_token(&self) -> Result<String> {
        let resp = self
            .http
            .post(format!(
                "{}/open-apis/auth/v3/tenant_access_token/internal",
                self.base_url
            ))
            .timeout(self.timeout)
            .json(&json!({"app_id": self.app_id, "app_secret": self.app_secret}))
            .send()
            .await?;
        let token: TenantTokenResponse = ensure_success(resp, "feishu")
            .await?
            .json()
            .await
            .map_err(|e| Error::Decode(format!("feishu token response: {}", e)))?;
        if token.code != 0 {
            return Err(Error::Api {
                backend: "feishu",
                code: token.code,
                msg: token.msg,
            });
        }
        Ok(token.tenant_access_token)
    }

    /**
     * \brief 用户信息接口地址；user_id 作为单个路径段编码，不能改写请求路径。
     */
    fn user_url(&self, user_id: &str) -> Result<reqwest::Url> {
        if matches!(user_id.trim(), "" | "." | "..") {
            return Err(Error::Payload(format!("invalid feishu user id: {:?}", user_id)));
        }
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("invalid feishu base_url {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("feishu base_url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(["open-apis", "contact", "v3", "users"])
            .push(user_id);
        Ok(url)
    }
}

#[async_trait]
impl UserDirectory for FeishuDirectory {
    async fn display_name(&self, user_id: &str) -> Result<String> {
        let url = self.user_url(user_id)?;
        let token = self.tenant_access_token().await?;
        let resp = self
            .http
            .get(url)
            .query(&[("user_id_type", "user_id")])
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await?;
        let info: UserInfoResponse = ensure_success(resp, "feishu")
            .await?
            .json()
            .await
            .map_err(|e| Error::Decode(format!("feishu user response: {}", e)))?;
        if info.code != 0 {
            return Err(Error::Api {
                backend: "feishu",
                code: info.code,
                msg: info.msg,
            });
        }
        let name = info
            .data
            .map(|d| d.user.name)
            .ok_or_else(|| Error::Decode("feishu user response missing data.user".into()))?;
        debug!(user_id, name = %name, "feishu user resolved");
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn directory(base_url: &str) -> FeishuDirectory {
        FeishuDirectory::new(&FeishuConfig {
            app_id: "cli_a".into(),
            app_secret: "s3cr3t".into(),
            base_url: base_url.into(),
            timeout_seconds: 5,
        })
        .unwrap()
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/open-apis/auth/v3/tenant_access_token/internal"))
            .and(body_json(json!({"app_id": "cli_a", "app_secret": "s3cr3t"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "ok", "tenant_access_token": "t-123", "expire": 7200
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let err = FeishuDirectory::new(&FeishuConfig {
            app_id: String::new(),
            app_secret: String::new(),
            base_url: String::new(),
            timeout_seconds: 5,
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn resolves_display_name() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/open-apis/contact/v3/users/U1"))
            .and(query_param("user_id_type", "user_id"))
            .and(header("authorization", "Bearer t-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "success", "data": {"user": {"name": "Zhang San"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let name = directory(&server.uri()).display_name("U1").await.unwrap();
        assert_eq!(name, "Zhang San");
    }

    #[tokio::test]
    async fn api_error_code_is_surfaced() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/open-apis/contact/v3/users/U404"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 41050, "msg": "no user authority error"
            })))
            .mount(&server)
            .await;

        let err = directory(&server.uri()).display_name("U404").await.unwrap_err();
        assert!(matches!(err, Error::Api { code: 41050, .. }));
    }

    #[tokio::test]
    async fn token_failure_stops_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/open-apis/auth/v3/tenant_access_token/internal"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 10003, "msg": "invalid param"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = directory(&server.uri()).display_name("U1").await.unwrap_err();
        assert!(err.to_string().contains("invalid param"));
    }

    #[tokio::test]
    async fn user_id_stays_inside_the_users_path() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "success", "data": {"user": {"name": "nobody"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        directory(&server.uri())
            .display_name("../../../admin/secret?x=#frag")
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let lookup = requests
            .iter()
            .find(|r| r.method.as_str() == "GET")
            .unwrap();
        let segments: Vec<&str> = lookup.url.path_segments().unwrap().collect();
        assert_eq!(segments.len(), 5);
        assert_eq!(&segments[..4], &["open-apis", "contact", "v3", "users"]);
        assert!(!segments[4].contains('/'));
        assert_eq!(lookup.url.query(), Some("user_id_type=user_id"));
        assert_eq!(lookup.url.fragment(), None);
    }

    #[tokio::test]
    async fn dot_segments_are_rejected_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        for id in ["..", ".", " "] {
            let err = directory(&server.uri()).display_name(id).await.unwrap_err();
            assert!(matches!(err, Error::Payload(_)));
        }
    }
}
