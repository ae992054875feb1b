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

//! Create-time admission logic for game servers: defaulting emitted as a
//! JSON patch, and validation answered with a structured failure. The HTTP
//! transport in front of these handlers lives elsewhere.

use eyre::WrapErr;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Status, StatusDetails};

use crate::api::{GameServer, GROUP};

/// Applies creation defaults to the raw game server object and returns the
/// difference as a JSON patch, ready for an admission review reply.
pub fn creation_mutation(raw: &serde_json::Value) -> crate::Result<json_patch::Patch> {
    let mut gs: GameServer = serde_json::from_value(raw.clone())
        .wrap_err("error deserializing game server for mutation")?;

    // this is the main logic, the rest is just patch plumbing
    gs.apply_defaults();

    let defaulted =
        serde_json::to_value(&gs).wrap_err("error serializing defaulted game server")?;
    Ok(json_patch::diff(raw, &defaulted))
}

/// Validates a game server at creation time. A denial carries the causes in
/// a structured `Status` reply.
pub fn creation_validation(gs: &GameServer) -> Result<(), Status> {
    let causes = gs.validate();
    if causes.is_empty() {
        return Ok(());
    }

    Err(Status {
        status: Some("Failure".into()),
        message: Some("GameServer configuration is invalid".into()),
        reason: Some("Invalid".into()),
        code: Some(422),
        details: Some(StatusDetails {
            name: gs.metadata.name.clone(),
            group: Some(GROUP.into()),
            kind: Some("GameServer".into()),
            causes: Some(causes),
            ..Default::default()
        }),
        metadata: Default::default(),
    })
}
