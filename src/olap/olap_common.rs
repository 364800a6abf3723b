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
use std::fmt;
use std::str::FromStr;

use crate::common::status::Status;

/// Closed range of tablet versions covered by one rowset.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Version {
    pub start: i64,
    pub end: i64,
}

impl Version {
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, other: &Version) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KeysType {
    DupKeys,
    UniqueKeys,
    AggKeys,
    PrimaryKeys,
}

impl KeysType {
    /// Models whose rows are merged when their keys collide.
    pub fn merges_duplicate_keys(&self) -> bool {
        !matches!(self, KeysType::DupKeys)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum AggregationType {
    #[default]
    None,
    Sum,
    Min,
    Max,
    Replace,
    ReplaceIfNotNull,
}

impl FromStr for AggregationType {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "NONE" => Ok(AggregationType::None),
            "SUM" => Ok(AggregationType::Sum),
            "MIN" => Ok(AggregationType::Min),
            "MAX" => Ok(AggregationType::Max),
            "REPLACE" => Ok(AggregationType::Replace),
            "REPLACE_IF_NOT_NULL" => Ok(AggregationType::ReplaceIfNotNull),
            other => Err(Status::NotSupported(format!(
                "unsupported aggregation type: {other}"
            ))),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AlterTabletType {
    SchemaChange,
    Rollup,
}

impl fmt::Display for AlterTabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlterTabletType::SchemaChange => write!(f, "SCHEMA_CHANGE"),
            AlterTabletType::Rollup => write!(f, "ROLLUP"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum SegmentsOverlap {
    #[default]
    Unknown,
    Overlapping,
    NonOverlapping,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TabletState {
    NotReady,
    Running,
}
