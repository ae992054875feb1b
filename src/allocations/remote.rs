/*
 * Copyright 2024 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Forwarding allocation requests to remote clusters over mutual TLS.

use super::AllocationError;
use crate::api::policy::ClusterConnectionInfo;
use crate::api::GameServerAllocation;
use crate::cluster::Secrets;

const SECRET_CLIENT_CERT_NAME: &str = "tls.crt";
const SECRET_CLIENT_KEY_NAME: &str = "tls.key";
const SECRET_CA_CERT_NAME: &str = "ca.crt";

/// Allocates from a remote cluster by forwarding the request to its
/// allocation endpoint, authenticated with the client certificate held in
/// the policy's secret. The client is rebuilt per call.
pub(crate) async fn allocate_from_remote_cluster(
    mut gsa: GameServerAllocation,
    connection_info: &ClusterConnectionInfo,
    secrets: &dyn Secrets,
    secret_namespace: &str,
) -> Result<GameServerAllocation, AllocationError> {
    let client =
        remote_cluster_client(secrets, secret_namespace, &connection_info.secret_name).await?;

    // clear the multi-cluster flag so the target cluster doesn't forward the
    // request again, and move it into the target's namespace
    gsa.spec.multi_cluster_setting.enabled = false;
    gsa.metadata.namespace = Some(connection_info.namespace.clone());

    post_allocation(&client, &connection_info.allocation_endpoints, &gsa).await
}

/// Posts the request to each endpoint in turn. A 5xx moves on to the next
/// endpoint while one remains; any other failure status is surfaced with
/// its body as the error.
pub(crate) async fn post_allocation(
    client: &reqwest::Client,
    endpoints: &[String],
    gsa: &GameServerAllocation,
) -> Result<GameServerAllocation, AllocationError> {
    for (i, endpoint) in endpoints.iter().enumerate() {
        let response = client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(gsa)
            .send()
            .await
            .map_err(|error| AllocationError::Remote(error.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|error| AllocationError::Remote(error.to_string()))?;

        if status.is_server_error() && i + 1 < endpoints.len() {
            tracing::warn!(endpoint, %status, "allocation request failed, trying next endpoint");
            continue;
        }
        if !status.is_success() {
            return Err(AllocationError::Remote(
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }

        return serde_json::from_slice(&body)
            .map_err(|error| AllocationError::Remote(error.to_string()));
    }

    Err(AllocationError::Remote(
        "no allocation endpoints configured".into(),
    ))
}

/// Builds an HTTP client presenting the client certificate from the given
/// secret, trusting the secret's CA certificate when provided and the
/// system roots otherwise.
async fn remote_cluster_client(
    secrets: &dyn Secrets,
    namespace: &str,
    secret_name: &str,
) -> Result<reqwest::Client, AllocationError> {
    let secret = secrets.get(namespace, secret_name).await?;
    let data = secret.data.unwrap_or_default();

    let (Some(cert), Some(key)) = (
        data.get(SECRET_CLIENT_CERT_NAME),
        data.get(SECRET_CLIENT_KEY_NAME),
    ) else {
        return Err(AllocationError::Remote(format!(
            "missing client certificate key pair in secret {secret_name}"
        )));
    };

    let identity_pem = [key.0.as_slice(), cert.0.as_slice()].concat();
    let identity = reqwest::Identity::from_pem(&identity_pem)
        .map_err(|error| AllocationError::Remote(error.to_string()))?;

    let mut builder = reqwest::Client::builder().use_rustls_tls().identity(identity);
    if let Some(ca) = data.get(SECRET_CA_CERT_NAME) {
        let certificate = reqwest::Certificate::from_pem(&ca.0)
            .map_err(|error| AllocationError::Remote(error.to_string()))?;
        builder = builder.add_root_certificate(certificate);
    }

    builder
        .build()
        .map_err(|error| AllocationError::Remote(error.to_string()))
}
