// Copyright 2021 The paxlog Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};

use log::trace;

use crate::types::Message;

/// Delivers messages to the node specified by `Message::to`.
///
/// A message might be dropped or duplicated, the protocol tolerates both.
pub trait Transport<T>: Send + Sync {
    fn send(&self, msgs: Vec<Message<T>>);
}

#[derive(Debug)]
struct Routes<T> {
    inboxes: HashMap<u64, Sender<Message<T>>>,
    isolated: HashSet<u64>,
}

/// An in-process network which routes messages through channels.
#[derive(Debug)]
pub struct LocalNetwork<T> {
    routes: Mutex<Routes<T>>,
}

impl<T> LocalNetwork<T> {
    pub fn new() -> LocalNetwork<T> {
        LocalNetwork {
            routes: Mutex::new(Routes {
                inboxes: HashMap::new(),
                isolated: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Routes<T>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the inbox of node `id`, a registered inbox is replaced.
    pub fn register(&self, id: u64) -> Receiver<Message<T>> {
        let (sender, receiver) = channel();
        self.lock().inboxes.insert(id, sender);
        receiver
    }

    pub fn unregister(&self, id: u64) {
        self.lock().inboxes.remove(&id);
    }

    /// Drop all messages from or to node `id`, except the ones it sends to
    /// itself.
    pub fn isolate(&self, id: u64) {
        self.lock().isolated.insert(id);
    }

    pub fn recover(&self, id: u64) {
        self.lock().isolated.remove(&id);
    }
}

impl<T> Default for LocalNetwork<T> {
    fn default() -> Self {
        LocalNetwork::new()
    }
}

impl<T: Send> Transport<T> for LocalNetwork<T> {
    fn send(&self, msgs: Vec<Message<T>>) {
        let routes = self.lock();
        for msg in msgs {
            let cut = msg.from != msg.to
                && (routes.isolated.contains(&msg.from) || routes.isolated.contains(&msg.to));
            if cut {
                trace!("drop {} from {} to {}", msg.detail, msg.from, msg.to);
                continue;
            }
            match routes.inboxes.get(&msg.to) {
                Some(inbox) => {
                    if let Err(e) = inbox.send(msg) {
                        let msg = e.0;
                        trace!("node {} is stopped, drop {}", msg.to, msg.detail);
                    }
                }
                None => trace!("node {} not exists, drop {}", msg.to, msg.detail),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::MsgDetail;

    fn learn(from: u64, to: u64) -> Message<String> {
        Message::new(from, to, 1, MsgDetail::Learn)
    }

    #[test]
    fn route_and_isolate() {
        let net = LocalNetwork::new();
        let r1 = net.register(1);
        let r2 = net.register(2);

        net.send(vec![learn(1, 2), learn(2, 1), learn(1, 3)]);
        assert_eq!(r2.try_recv().unwrap().from, 1);
        assert_eq!(r1.try_recv().unwrap().from, 2);

        net.isolate(2);
        net.send(vec![learn(1, 2), learn(2, 1), learn(2, 2)]);
        assert!(r1.try_recv().is_err());
        assert_eq!(r2.try_recv().unwrap().from, 2);
        assert!(r2.try_recv().is_err());

        net.recover(2);
        net.send(vec![learn(1, 2)]);
        assert!(r2.try_recv().is_ok());

        drop(r1);
        net.send(vec![learn(2, 1)]);
        net.unregister(1);
        net.send(vec![learn(2, 1)]);
    }
}
