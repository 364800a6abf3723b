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
use crate::novarocks_config::config as novarocks_app_config;

pub fn memory_limitation_per_thread_for_schema_change_bytes() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| {
            c.schema_change
                .memory_limitation_per_thread_for_schema_change_bytes
        })
        .unwrap_or(2 * 1024 * 1024 * 1024)
}

pub fn schema_change_sort_max_buffered_rows() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.schema_change.schema_change_sort_max_buffered_rows)
        .unwrap_or(0)
}

pub fn schema_change_batch_size() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.schema_change.schema_change_batch_size)
        .unwrap_or(4096)
}

pub fn be_exec_version() -> i32 {
    novarocks_app_config()
        .ok()
        .map(|c| c.schema_change.be_exec_version)
        .unwrap_or(5)
}
