// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Error taxonomy shared by the storage layer.
//!
//! Every fallible storage operation returns `Result<T, Status>`. The variants
//! mirror the failure classes a caller must distinguish: a conflict is
//! retryable, everything else is terminal for the current alter job.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Status {
    /// Another alter job already owns the tablet.
    #[error("alter conflict: {0}")]
    AlterConflict(String),
    /// A cast or nullability change would corrupt data.
    #[error("data quality error: {0}")]
    DataQuality(String),
    /// Row accounting after a conversion did not balance.
    #[error("alter status error: {0}")]
    RowCountMismatch(String),
    #[error("memory limit exceeded: {0}")]
    MemLimitExceeded(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("version already exists: {0}")]
    VersionAlreadyExist(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type StatusResult<T> = Result<T, Status>;

impl Status {
    pub fn is_alter_conflict(&self) -> bool {
        matches!(self, Status::AlterConflict(_))
    }

    pub fn is_data_quality(&self) -> bool {
        matches!(self, Status::DataQuality(_))
    }

    pub fn is_row_count_mismatch(&self) -> bool {
        matches!(self, Status::RowCountMismatch(_))
    }

    pub fn is_mem_limit_exceeded(&self) -> bool {
        matches!(self, Status::MemLimitExceeded(_))
    }

    pub fn is_version_already_exist(&self) -> bool {
        matches!(self, Status::VersionAlreadyExist(_))
    }

    /// Only conflicts are worth retrying; a failed conversion leaves nothing to resume.
    pub fn is_retryable(&self) -> bool {
        self.is_alter_conflict()
    }

    /// Prefix the message with the operation that observed the failure.
    pub fn with_context(self, context: impl AsRef<str>) -> Self {
        let context = context.as_ref();
        match self {
            Status::AlterConflict(m) => Status::AlterConflict(format!("{context}: {m}")),
            Status::DataQuality(m) => Status::DataQuality(format!("{context}: {m}")),
            Status::RowCountMismatch(m) => Status::RowCountMismatch(format!("{context}: {m}")),
            Status::MemLimitExceeded(m) => Status::MemLimitExceeded(format!("{context}: {m}")),
            Status::Io(m) => Status::Io(format!("{context}: {m}")),
            Status::NotSupported(m) => Status::NotSupported(format!("{context}: {m}")),
            Status::InvalidArgument(m) => Status::InvalidArgument(format!("{context}: {m}")),
            Status::NotFound(m) => Status::NotFound(format!("{context}: {m}")),
            Status::VersionAlreadyExist(m) => {
                Status::VersionAlreadyExist(format!("{context}: {m}"))
            }
            Status::Internal(m) => Status::Internal(format!("{context}: {m}")),
        }
    }
}

impl From<arrow::error::ArrowError> for Status {
    fn from(err: arrow::error::ArrowError) -> Self {
        Status::Internal(format!("arrow: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(Status::AlterConflict("tablet 1".to_string()).is_retryable());
        assert!(!Status::RowCountMismatch("x".to_string()).is_retryable());
        assert!(!Status::Io("disk".to_string()).is_retryable());
    }

    #[test]
    fn context_keeps_variant() {
        let st = Status::DataQuality("null changed".to_string()).with_context("rowset [2-2]");
        assert!(st.is_data_quality());
        assert_eq!(
            st.to_string(),
            "data quality error: rowset [2-2]: null changed"
        );
    }
}
