//! [`ClusterClient`] over the cluster's REST administration API and its query service.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, PoisonError},
};

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::debug;
use url::Url;

use super::{
    bucket::{BucketInfo, BucketKind, BucketSettings},
    client::{ClientError, ClusterClient},
    index::{IndexDefinition, IndexInfo, IndexState},
    nodes::{NodeSelector, RandomNodeSelector},
    user::{UserInfo, UserRole, UserSettings},
};
use crate::v1::config::ProviderConfig;

const MIB: u64 = 1024 * 1024;
const HEALTHY: &str = "healthy";
/// Query service codes meaning the keyspace or index does not exist.
const QUERY_NOT_FOUND: [u32; 3] = [12003, 12004, 12016];

pub struct RestClusterClient {
    handle: Handle,
    http: Client,
    admin_url: Url,
    username: String,
    password: String,
    /// Configured or discovered on first use.
    query_url: Mutex<Option<Url>>,
    nodes: Box<dyn NodeSelector>,
}

impl RestClusterClient {
    pub fn connect(handle: &Handle, config: &ProviderConfig) -> Result<Self, ClientError> {
        let admin_url = config
            .admin_url()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let query_url = config
            .query_base_url()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        Ok(Self {
            handle: handle.clone(),
            http,
            admin_url,
            username: config.username.clone(),
            password: config.password.clone(),
            query_url: Mutex::new(query_url),
            nodes: Box::new(RandomNodeSelector),
        })
    }

    pub fn with_node_selector(mut self, nodes: impl NodeSelector + 'static) -> Self {
        self.nodes = Box::new(nodes);
        self
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    async fn send(&self, request: RequestBuilder, object: &str) -> Result<Response, ClientError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let status = response.status();
        debug!(%status, url = %response.url(), "Cluster answered");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Connection(format!(
                "{status} on {object}, check COUCHBASE_USERNAME and COUCHBASE_PASSWORD"
            )),
            StatusCode::NOT_FOUND => ClientError::NotFound(object.to_string()),
            _ => ClientError::Rejected {
                status: status.as_u16(),
                message: body,
            },
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        object: &str,
    ) -> Result<Option<T>, ClientError> {
        match self.send(self.http.get(url), object).await {
            Ok(response) => response
                .json::<T>()
                .await
                .map(Some)
                .map_err(|e| ClientError::Decode(format!("{object}: {e}"))),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn healthy_node(&self) -> Result<Url, ClientError> {
        let pool: PoolsDefault = self
            .get_json(endpoint(&self.admin_url, &["pools", "default"])?, "pools/default")
            .await?
            .ok_or_else(|| ClientError::NotFound("pools/default".to_string()))?;
        let healthy = pool
            .nodes
            .iter()
            .filter(|node| node.status == HEALTHY)
            .map(|node| node_base(&self.admin_url, node))
            .collect::<Result<Vec<_>, _>>()?;
        let base = self
            .nodes
            .select(&healthy)
            .ok_or_else(|| ClientError::Connection("no healthy node in the cluster".to_string()))?;
        Url::parse(base).map_err(|e| ClientError::Decode(format!("node {base}: {e}")))
    }

    async fn query_base(&self) -> Result<Url, ClientError> {
        let cached = self.query_url.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(url) = cached {
            return Ok(url);
        }
        let services: NodeServices = self
            .get_json(
                endpoint(&self.admin_url, &["pools", "default", "nodeServices"])?,
                "nodeServices",
            )
            .await?
            .ok_or_else(|| ClientError::NotFound("nodeServices".to_string()))?;
        let tls = self.admin_url.scheme() == "https";
        let service = if tls { "n1qlSSL" } else { "n1ql" };
        let (host, port) = services
            .nodes_ext
            .iter()
            .find_map(|node| {
                node.services
                    .get(service)
                    .map(|port| (node.hostname.clone(), *port))
            })
            .ok_or_else(|| ClientError::Connection("no node runs the query service".to_string()))?;
        let host = match host {
            Some(host) => host,
            None => self
                .admin_url
                .host_str()
                .map(str::to_string)
                .ok_or_else(|| ClientError::Decode(format!("{} has no host", self.admin_url)))?,
        };
        let raw = format!("{}://{}:{}/", self.admin_url.scheme(), host, port);
        let url = Url::parse(&raw).map_err(|e| ClientError::Decode(format!("{raw}: {e}")))?;
        debug!(%url, "Discovered query service");
        *self.query_url.lock().unwrap_or_else(PoisonError::into_inner) = Some(url.clone());
        Ok(url)
    }

    async fn query<T: DeserializeOwned>(
        &self,
        statement: &str,
        args: Value,
    ) -> Result<Vec<T>, ClientError> {
        let url = endpoint(&self.query_base().await?, &["query", "service"])?;
        debug!(%statement, "Running query");
        let form = [
            ("statement", statement.to_string()),
            ("args", args.to_string()),
        ];
        let response = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .form(&form)
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(ClientError::Connection(format!(
                "{status} from the query service, check the credentials"
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let answer: QueryResponse<T> = match serde_json::from_str(&body) {
            Ok(answer) => answer,
            Err(_) if !status.is_success() => {
                return Err(ClientError::Rejected {
                    status: status.as_u16(),
                    message: body,
                })
            }
            Err(e) => return Err(ClientError::Decode(format!("query response: {e}"))),
        };
        match answer.errors.into_iter().next() {
            None if status.is_success() => Ok(answer.results),
            None => Err(ClientError::Rejected {
                status: status.as_u16(),
                message: body,
            }),
            Some(err) if QUERY_NOT_FOUND.contains(&err.code) || err.msg.contains("not found") => {
                Err(ClientError::NotFound(err.msg))
            }
            Some(err) => Err(ClientError::Rejected {
                status: status.as_u16(),
                message: format!("{}: {}", err.code, err.msg),
            }),
        }
    }
}

/// Admin base URL of one node. `hostname` carries the plain admin port, so TLS connections
/// switch to the node's `httpsMgmt` port, or the configured one when the node does not say.
fn node_base(admin_url: &Url, node: &PoolNode) -> Result<String, ClientError> {
    let raw = format!("{}://{}/", admin_url.scheme(), node.hostname);
    let mut url = Url::parse(&raw)
        .map_err(|e| ClientError::Decode(format!("node {}: {e}", node.hostname)))?;
    if url.scheme() == "https" {
        if let Some(port) = node.ports.https_mgmt.or(admin_url.port()) {
            url.set_port(Some(port))
                .map_err(|_| ClientError::Decode(format!("node {}: cannot set port", node.hostname)))?;
        }
    }
    Ok(url.into())
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, ClientError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ClientError::Connection(format!("{base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn flag(value: bool) -> String {
    String::from(if value { "1" } else { "0" })
}

fn bucket_form(settings: &BucketSettings, with_name: bool) -> Vec<(&'static str, String)> {
    let mut form = vec![];
    if with_name {
        form.push(("name", settings.name.clone()));
    }
    form.push(("bucketType", settings.kind.to_string()));
    form.push(("ramQuotaMB", settings.quota.to_string()));
    form.push(("flushEnabled", flag(settings.flush_enabled)));
    if settings.kind.replicated() {
        form.push(("replicaNumber", settings.replicas.to_string()));
    }
    if settings.kind == BucketKind::Couchbase {
        form.push(("replicaIndex", flag(settings.index_replicas)));
    }
    if let Some(password) = &settings.password {
        form.push(("authType", "sasl".to_string()));
        form.push(("saslPassword", password.clone()));
    }
    form
}

fn create_index_statement(definition: &IndexDefinition) -> String {
    if definition.is_primary() {
        format!(
            "CREATE PRIMARY INDEX `{}` ON `{}`",
            definition.name, definition.bucket
        )
    } else {
        format!(
            "CREATE INDEX `{}` ON `{}`({})",
            definition.name,
            definition.bucket,
            definition.fields.join(", ")
        )
    }
}

const INDEX_LOOKUP: &str = "SELECT idx.name, idx.keyspace_id, idx.is_primary, idx.index_key, idx.state \
     FROM system:indexes AS idx WHERE idx.keyspace_id = $1 AND idx.name = $2";

impl ClusterClient for RestClusterClient {
    fn get_bucket(&self, name: &str) -> Result<Option<BucketInfo>, ClientError> {
        self.block_on(async {
            let url = endpoint(&self.admin_url, &["pools", "default", "buckets", name])?;
            self.get_json::<BucketResponse>(url, name)
                .await?
                .map(BucketInfo::try_from)
                .transpose()
        })
    }

    fn insert_bucket(&self, settings: &BucketSettings) -> Result<(), ClientError> {
        self.block_on(async {
            let url = endpoint(&self.admin_url, &["pools", "default", "buckets"])?;
            let request = self.http.post(url).form(&bucket_form(settings, true));
            self.send(request, &settings.name).await.map(|_| ())
        })
    }

    /// Bucket edits go to one healthy node directly.
    fn update_bucket(&self, settings: &BucketSettings) -> Result<(), ClientError> {
        self.block_on(async {
            let node = self.healthy_node().await?;
            let url = endpoint(&node, &["pools", "default", "buckets", settings.name.as_str()])?;
            debug!(%url, bucket = %settings.name, "Updating bucket on node");
            let request = self.http.post(url).form(&bucket_form(settings, false));
            self.send(request, &settings.name).await.map(|_| ())
        })
    }

    fn remove_bucket(&self, name: &str) -> Result<(), ClientError> {
        self.block_on(async {
            let url = endpoint(&self.admin_url, &["pools", "default", "buckets", name])?;
            self.send(self.http.delete(url), name).await.map(|_| ())
        })
    }

    fn create_index(&self, definition: &IndexDefinition) -> Result<(), ClientError> {
        self.block_on(async {
            self.query::<Value>(&create_index_statement(definition), json!([]))
                .await
                .map(|_| ())
        })
    }

    fn get_index(&self, bucket: &str, name: &str) -> Result<Option<IndexInfo>, ClientError> {
        self.block_on(async {
            let rows = self
                .query::<IndexRow>(INDEX_LOOKUP, json!([bucket, name]))
                .await?;
            Ok(rows.into_iter().next().map(|row| IndexInfo {
                bucket: row.keyspace_id,
                name: row.name,
                fields: row.index_key.iter().map(|key| key.replace('`', "")).collect(),
                is_primary: row.is_primary,
                state: row.state,
            }))
        })
    }

    fn drop_index(&self, bucket: &str, name: &str) -> Result<(), ClientError> {
        self.block_on(async {
            let statement = format!("DROP INDEX `{bucket}`.`{name}`");
            self.query::<Value>(&statement, json!([])).await.map(|_| ())
        })
    }

    fn upsert_user(&self, settings: &UserSettings) -> Result<(), ClientError> {
        self.block_on(async {
            let url = endpoint(
                &self.admin_url,
                &["settings", "rbac", "users", "local", settings.name.as_str()],
            )?;
            let roles = settings
                .roles
                .iter()
                .map(UserRole::to_rbac)
                .collect::<Vec<_>>()
                .join(",");
            let form = [("password", settings.password.clone()), ("roles", roles)];
            let request = self.http.put(url).form(&form);
            self.send(request, &settings.name).await.map(|_| ())
        })
    }

    fn get_user(&self, name: &str) -> Result<Option<UserInfo>, ClientError> {
        self.block_on(async {
            let url = endpoint(&self.admin_url, &["settings", "rbac", "users", "local", name])?;
            Ok(self
                .get_json::<UserResponse>(url, name)
                .await?
                .map(UserInfo::from))
        })
    }

    fn remove_user(&self, name: &str) -> Result<(), ClientError> {
        self.block_on(async {
            let url = endpoint(&self.admin_url, &["settings", "rbac", "users", "local", name])?;
            self.send(self.http.delete(url), name).await.map(|_| ())
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketResponse {
    name: String,
    bucket_type: String,
    quota: Quota,
    #[serde(default)]
    replica_number: u8,
    #[serde(default)]
    replica_index: bool,
    #[serde(default)]
    controllers: Controllers,
}

#[derive(Debug, Deserialize)]
struct Quota {
    #[serde(rename = "rawRAM")]
    raw_ram: u64,
}

#[derive(Debug, Default, Deserialize)]
struct Controllers {
    flush: Option<String>,
}

impl TryFrom<BucketResponse> for BucketInfo {
    type Error = ClientError;
    fn try_from(response: BucketResponse) -> Result<Self, Self::Error> {
        let kind = response.bucket_type.parse::<BucketKind>().map_err(|_| {
            ClientError::Decode(format!("unknown bucket type {}", response.bucket_type))
        })?;
        Ok(Self {
            name: response.name,
            kind,
            quota: response.quota.raw_ram / MIB,
            replicas: response.replica_number,
            flush_enabled: response.controllers.flush.is_some(),
            index_replicas: response.replica_index,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PoolsDefault {
    #[serde(default)]
    nodes: Vec<PoolNode>,
}

#[derive(Debug, Deserialize)]
struct PoolNode {
    hostname: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    ports: NodePorts,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodePorts {
    https_mgmt: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeServices {
    #[serde(default)]
    nodes_ext: Vec<NodeExt>,
}

#[derive(Debug, Deserialize)]
struct NodeExt {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    errors: Vec<QueryError>,
}

#[derive(Debug, Deserialize)]
struct QueryError {
    code: u32,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct IndexRow {
    name: String,
    keyspace_id: String,
    #[serde(default)]
    is_primary: bool,
    #[serde(default)]
    index_key: Vec<String>,
    #[serde(default)]
    state: IndexState,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    roles: Vec<RoleRecord>,
}

#[derive(Debug, Deserialize)]
struct RoleRecord {
    role: String,
    #[serde(default)]
    bucket_name: Option<String>,
}

impl From<UserResponse> for UserInfo {
    fn from(response: UserResponse) -> Self {
        Self {
            name: response.id,
            roles: response
                .roles
                .into_iter()
                .map(|record| UserRole {
                    role: record.role,
                    bucket: record.bucket_name.filter(|bucket| !bucket.is_empty()),
                })
                .collect(),
        }
    }
}
