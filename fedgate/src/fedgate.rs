// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of fedgate.
//
// fedgate is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// fedgate is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with fedgate.  If not,
// see <http://www.gnu.org/licenses/>.


use std::sync::Arc;

use crate::{
    convert::StorageConverter,
    dispatcher::Dispatcher,
    domain_gate::{self, DomainGate},
    domain_permissions::{self, DomainPermissions},
    metrics::Instruments,
    side_effects::Enqueue,
    storage::Backend as StorageBackend,
};

/// Application state available to all handlers
pub struct Fedgate {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub gate: Arc<DomainGate>,
    pub dispatcher: Dispatcher,
    pub permissions: DomainPermissions,
    pub instruments: Arc<Instruments>,
}

impl Fedgate {
    /// Wire-up the ingestion pipeline over `storage`, handing side effects to `queue`
    pub fn new(
        gate_config: &domain_gate::Config,
        permissions_config: &domain_permissions::Config,
        storage: Arc<dyn StorageBackend + Send + Sync>,
        queue: Arc<dyn Enqueue + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> Fedgate {
        Fedgate {
            gate: Arc::new(DomainGate::new(
                gate_config,
                storage.clone(),
                instruments.clone(),
            )),
            dispatcher: Dispatcher::new(
                storage.clone(),
                Arc::new(StorageConverter::new(storage.clone())),
                queue,
                instruments.clone(),
            ),
            permissions: DomainPermissions::new(permissions_config, storage.clone()),
            storage,
            instruments,
        }
    }
    /// The username of the instance actor, which receives deliveries to the shared inbox
    pub fn instance_username(&self) -> &str {
        self.gate.host()
    }
}
