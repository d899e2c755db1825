// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::SinkError;
use crate::probe::Category;
use crate::table::UsageTable;
use async_trait::async_trait;

/// Downstream target for normalized tables.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, category: Category, table: &UsageTable) -> Result<(), SinkError>;
}
