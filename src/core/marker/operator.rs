// Tencent is pleased to support the open source community by making Polaris available.
//
// Copyright (C) 2019 THL A29 Limited, a Tencent company. All rights reserved.
//
// Licensed under the BSD 3-Clause License (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://opensource.org/licenses/BSD-3-Clause
//
// Unless required by applicable law or agreed to in writing, software distributed
// under the License is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR
// CONDITIONS OF ANY KIND, either express or implied. See the License for the
// specific language governing permissions and limitations under the License.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::model::error::{ErrorCode, MeshError};

/// Operate decides whether a value matches an expression.
pub type Operate = fn(value: &str, expression: &str) -> bool;

static OPERATOR_PLUGIN: Lazy<RwLock<HashMap<&'static str, Operate>>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Operate> = HashMap::new();
    m.insert("exact", exact);
    m.insert("contains", contains);
    m.insert("regex", regex_match);
    m.insert("noEqu", no_equ);
    m.insert("less", less);
    m.insert("noLess", no_less);
    m.insert("greater", greater);
    m.insert("noGreater", no_greater);
    RwLock::new(m)
});

/// install adds a custom operator under a static name.
pub fn install(name: &'static str, op: Operate) {
    OPERATOR_PLUGIN.write().unwrap().insert(name, op);
}

/// match_operator compares value against expression with the named
/// operator; an unknown operator is an error, not a silent mismatch.
pub fn match_operator(operator: &str, value: &str, expression: &str) -> Result<bool, MeshError> {
    let operators = OPERATOR_PLUGIN.read().unwrap();
    match operators.get(operator) {
        Some(f) => Ok(f(value, expression)),
        None => Err(MeshError::new(
            ErrorCode::InvalidRule,
            format!("invalid match method [{}]", operator),
        )),
    }
}

fn exact(value: &str, express: &str) -> bool {
    value == express
}

fn contains(value: &str, express: &str) -> bool {
    value.contains(express)
}

fn regex_match(value: &str, express: &str) -> bool {
    match Regex::new(express) {
        Ok(reg) => reg.is_match(value),
        Err(_) => false,
    }
}

fn no_equ(value: &str, express: &str) -> bool {
    value != express
}

fn no_less(value: &str, express: &str) -> bool {
    cmp_int(value, express, |v, e| v >= e)
}

fn less(value: &str, express: &str) -> bool {
    cmp_int(value, express, |v, e| v < e)
}

fn no_greater(value: &str, express: &str) -> bool {
    cmp_int(value, express, |v, e| v <= e)
}

fn greater(value: &str, express: &str) -> bool {
    cmp_int(value, express, |v, e| v > e)
}

// numeric operators fail false on non-numeric input
fn cmp_int(value: &str, express: &str, op: fn(i64, i64) -> bool) -> bool {
    let v = match value.trim().parse::<i64>() {
        Ok(v) => v,
        Err(_) => return false,
    };
    let e = match express.trim().parse::<i64>() {
        Ok(e) => e,
        Err(_) => return false,
    };
    op(v, e)
}
