// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Appends each batch to a local file as one JSON push payload per line.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use super::{ShipError, Shipper};
use crate::batch::Batch;
use crate::config::FileOutput;
use crate::record::Labels;

pub struct FileShipper {
    name: String,
    path: PathBuf,
}

impl FileShipper {
    #[must_use]
    pub fn new(config: &FileOutput) -> Self {
        FileShipper {
            name: format!("file:{}", config.filename.display()),
            path: config.filename.clone(),
        }
    }
}

#[async_trait]
impl Shipper for FileShipper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ship(&self, batch: &Batch) -> Result<(), ShipError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut line = serde_json::to_vec(&batch.to_push_request(&Labels::new()))
            .map_err(|e| ShipError::Payload(e.to_string()))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
