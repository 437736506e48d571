// Recording engine and link doubles for unit tests

use crate::engine::{encode_event, Adapter, Engine, EngineStatus, STATE_CONNECTED};
use crate::error::{Error, Result};
use crate::event_monitor::{EventMonitor, EventSink};
use crate::link::LinkOps;
use crate::types::Interface;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

/// Everything the controllers asked of the engine or the OS, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start {
        adapter: Adapter,
        private_key: String,
    },
    Stop,
    Connect {
        public_key: String,
        endpoint: SocketAddr,
    },
    Disconnect,
    SetMeshnet(String),
    SetMeshnetOff,
    SetPrivateKey(String),
    SetFwmark(u32),
    NetworkChange,
    Lookup,
    Delete,
    AddAddress(IpAddr),
    RemoveAddress(IpAddr),
    Up,
    Mtu(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStep {
    Delete,
    AddAddress,
    RemoveAddress,
    Up,
    Mtu,
}

/// Scripted behaviour and observable OS state
pub struct Script {
    pub link_exists: bool,
    pub engine_running: bool,
    pub addresses: Vec<IpAddr>,
    pub kernel_broken: bool,
    pub userspace_broken: bool,
    pub fwmark_status: EngineStatus,
    pub stop_status: EngineStatus,
    pub connect_status: EngineStatus,
    pub disconnect_status: EngineStatus,
    pub private_key_status: EngineStatus,
    pub meshnet_off_status: EngineStatus,
    /// Results of successive `set_meshnet` calls, `Ok` once drained
    pub meshnet_results: VecDeque<EngineStatus>,
    /// State emitted right after a successful connect
    pub emit_on_connect: Option<String>,
    pub snapshot: String,
    pub fail_link: Option<LinkStep>,
    pub uplink_mtu: Option<u32>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            link_exists: false,
            engine_running: false,
            addresses: Vec::new(),
            kernel_broken: false,
            userspace_broken: false,
            fwmark_status: EngineStatus::Ok,
            stop_status: EngineStatus::Ok,
            connect_status: EngineStatus::Ok,
            disconnect_status: EngineStatus::Ok,
            private_key_status: EngineStatus::Ok,
            meshnet_off_status: EngineStatus::Ok,
            meshnet_results: VecDeque::new(),
            emit_on_connect: Some(STATE_CONNECTED.to_string()),
            snapshot: "[]".to_string(),
            fail_link: None,
            uplink_mtu: None,
        }
    }
}

/// Engine and OS double sharing one call log
pub struct FakeSystem {
    calls: Mutex<Vec<Call>>,
    script: Mutex<Script>,
    sink: EventSink,
}

impl FakeSystem {
    pub fn new(monitor: &EventMonitor) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            sink: monitor.sink(),
        })
    }

    pub fn script(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn connects(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Connect { public_key, .. } => Some(public_key),
                _ => None,
            })
            .collect()
    }

    pub fn starts(&self) -> Vec<Adapter> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Start { adapter, .. } => Some(adapter),
                _ => None,
            })
            .collect()
    }

    pub fn engine_running(&self) -> bool {
        self.script.lock().unwrap().engine_running
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.script.lock().unwrap().addresses.clone()
    }

    pub fn last_private_key(&self) -> Option<String> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::SetPrivateKey(key) => Some(key),
            Call::Start { private_key, .. } => Some(private_key),
            _ => None,
        })
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn link_step(&self, step: LinkStep) -> Result<()> {
        if self.script.lock().unwrap().fail_link == Some(step) {
            return Err(Error::configuration("fake link", format!("{:?} failed", step)));
        }
        Ok(())
    }
}

impl Engine for Arc<FakeSystem> {
    fn start_named(&self, private_key: &str, adapter: Adapter, _name: &str) -> EngineStatus {
        self.record(Call::Start {
            adapter,
            private_key: private_key.to_string(),
        });
        let mut script = self.script.lock().unwrap();
        let broken = match adapter {
            Adapter::Kernel => script.kernel_broken,
            Adapter::Userspace => script.userspace_broken,
        };
        if broken {
            return EngineStatus::Error;
        }
        script.engine_running = true;
        script.link_exists = true;
        EngineStatus::Ok
    }

    fn stop(&self) -> EngineStatus {
        self.record(Call::Stop);
        let mut script = self.script.lock().unwrap();
        if script.stop_status.is_ok() {
            script.engine_running = false;
            script.link_exists = false;
            script.addresses.clear();
        }
        script.stop_status
    }

    fn connect_to_exit_node(
        &self,
        public_key: &str,
        _allowed_range: &str,
        endpoint: SocketAddr,
    ) -> EngineStatus {
        self.record(Call::Connect {
            public_key: public_key.to_string(),
            endpoint,
        });
        let (status, emit) = {
            let script = self.script.lock().unwrap();
            (script.connect_status, script.emit_on_connect.clone())
        };
        if status.is_ok() {
            if let Some(state) = emit {
                self.sink.deliver(&encode_event(&state, public_key));
            }
        }
        status
    }

    fn disconnect_from_exit_nodes(&self) -> EngineStatus {
        self.record(Call::Disconnect);
        self.script.lock().unwrap().disconnect_status
    }

    fn set_meshnet(&self, raw: &str) -> EngineStatus {
        self.record(Call::SetMeshnet(raw.to_string()));
        self.script
            .lock()
            .unwrap()
            .meshnet_results
            .pop_front()
            .unwrap_or(EngineStatus::Ok)
    }

    fn set_meshnet_off(&self) -> EngineStatus {
        self.record(Call::SetMeshnetOff);
        self.script.lock().unwrap().meshnet_off_status
    }

    fn set_private_key(&self, private_key: &str) -> EngineStatus {
        self.record(Call::SetPrivateKey(private_key.to_string()));
        self.script.lock().unwrap().private_key_status
    }

    fn set_fwmark(&self, mark: u32) -> EngineStatus {
        self.record(Call::SetFwmark(mark));
        self.script.lock().unwrap().fwmark_status
    }

    fn notify_network_change(&self) -> EngineStatus {
        self.record(Call::NetworkChange);
        EngineStatus::Ok
    }

    fn generate_secret_key(&self) -> String {
        "generated-secret".to_string()
    }

    fn generate_public_key(&self, private_key: &str) -> String {
        format!("public-of-{}", private_key)
    }

    fn status_snapshot(&self) -> String {
        self.script.lock().unwrap().snapshot.clone()
    }
}

impl LinkOps for Arc<FakeSystem> {
    async fn lookup(&self, name: &str) -> Result<Option<Interface>> {
        self.record(Call::Lookup);
        let exists = self.script.lock().unwrap().link_exists;
        Ok(exists.then(|| Interface {
            name: name.to_string(),
            index: 7,
        }))
    }

    async fn delete(&self, _name: &str) -> Result<()> {
        self.record(Call::Delete);
        self.link_step(LinkStep::Delete)?;
        self.script.lock().unwrap().link_exists = false;
        Ok(())
    }

    async fn add_address(&self, _iface: &Interface, addr: IpAddr) -> Result<()> {
        self.record(Call::AddAddress(addr));
        self.link_step(LinkStep::AddAddress)?;
        self.script.lock().unwrap().addresses.push(addr);
        Ok(())
    }

    async fn remove_address(&self, _iface: &Interface, addr: IpAddr) -> Result<()> {
        self.record(Call::RemoveAddress(addr));
        self.link_step(LinkStep::RemoveAddress)?;
        self.script.lock().unwrap().addresses.retain(|a| *a != addr);
        Ok(())
    }

    async fn set_up(&self, _iface: &Interface) -> Result<()> {
        self.record(Call::Up);
        self.link_step(LinkStep::Up)
    }

    async fn set_mtu(&self, _iface: &Interface, mtu: u32) -> Result<()> {
        self.record(Call::Mtu(mtu));
        self.link_step(LinkStep::Mtu)
    }

    async fn uplink_mtu(&self) -> Option<u32> {
        self.script.lock().unwrap().uplink_mtu
    }
}
