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

use std::sync::Arc;

use crate::core::loadbalancer::Strategy;
use crate::core::model::error::MeshError;
use crate::core::model::invocation::Invocation;
use crate::core::model::naming::MicroServiceInstance;

pub struct RandomStrategy {
    instances: Vec<Arc<MicroServiceInstance>>,
}

pub fn new_strategy() -> Box<dyn Strategy> {
    Box::new(RandomStrategy {
        instances: Vec::new(),
    })
}

impl Strategy for RandomStrategy {
    fn receive_data(
        &mut self,
        _inv: &Invocation,
        instances: Vec<Arc<MicroServiceInstance>>,
        _service_key: &str,
    ) {
        self.instances = instances;
    }

    fn pick(&mut self) -> Result<Arc<MicroServiceInstance>, MeshError> {
        if self.instances.is_empty() {
            return Err(MeshError::no_available_instance("none available instance"));
        }
        let index = rand::random::<u64>() as usize % self.instances.len();
        Ok(self.instances[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::naming::Endpoint;
    use std::collections::HashMap;

    #[test]
    fn test_every_instance_gets_picked() {
        let list: Vec<Arc<MicroServiceInstance>> = (0..3)
            .map(|i| {
                let mut eps = HashMap::new();
                eps.insert("rest".to_string(), Endpoint::new(format!("10.0.0.{}:80", i)));
                Arc::new(MicroServiceInstance::new(
                    format!("i-{}", i),
                    "shop",
                    "1.0.0",
                    eps,
                ))
            })
            .collect();
        let inv = Invocation::new("shop");
        let mut seen: HashMap<String, u32> = HashMap::new();
        for _ in 0..300 {
            let mut s = new_strategy();
            s.receive_data(&inv, list.clone(), "random-test|");
            *seen
                .entry(s.pick().unwrap().instance_id.clone())
                .or_default() += 1;
        }
        assert_eq!(seen.len(), 3);
    }
}
