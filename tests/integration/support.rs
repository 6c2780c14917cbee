// Shared fixtures: a scripted in-process gateway and a service wired to an
// in-memory store with every sleep set to zero.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use groupcast::atoms::types::{Channel, ChannelMode, ChannelStatus, PlanStatus};
use groupcast::engine::gateway::{
    map_upstream_status, ChannelHealth, ChannelSummary, ErrorKind, GatewayApi, GatewayError,
    GatewayGroup, GatewayResult, GroupMetadata, Participant, ParticipantRank, PhoneLoginOutcome,
    ProvisionedChannel, QrImage, QrOutcome, SentMessage,
};
use groupcast::engine::plan::StaticPlanOracle;
use groupcast::engine::store::GroupcastStore;
use groupcast::{EngineConfig, GroupcastService, SyncProgress};

/// The account the fake gateway reports as logged in.
pub const ME: &str = "972500000001@s.whatsapp.net";

// 1x1 transparent PNG
pub const PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

pub fn health(raw: &str) -> ChannelHealth {
    ChannelHealth { state: map_upstream_status(raw), raw: raw.to_string(), me: Some(ME.to_string()) }
}

pub fn gateway_err(kind: ErrorKind) -> GatewayError {
    GatewayError::new(kind, format!("scripted {:?}", kind))
}

pub fn qr_image() -> QrOutcome {
    QrOutcome::Image(QrImage::parse(PNG).unwrap())
}

/// `n` groups numbered from `from`: `<i>@g.us`, "Group <i>".
pub fn groups(from: u32, n: u32) -> Vec<GatewayGroup> {
    (from..from + n)
        .map(|i| GatewayGroup { id: format!("{}@g.us", i), name: format!("Group {}", i), participant_count: 3 })
        .collect()
}

pub fn meta_with_rank(group_id: &str, rank: ParticipantRank) -> GroupMetadata {
    GroupMetadata {
        id: group_id.to_string(),
        name: group_id.to_string(),
        participants: vec![
            Participant { id: "111@s.whatsapp.net".into(), rank: ParticipantRank::Member },
            Participant { id: ME.to_string(), rank },
        ],
    }
}

// ── Scripted gateway ───────────────────────────────────────────────────────

type OnList = Box<dyn Fn(u32) + Send + Sync>;
type OnStatus = Box<dyn Fn(&str) + Send + Sync>;

/// Every method pops its script queue first and falls back to a default.
/// Calls are recorded as `"<method> <arg>"`.
#[derive(Default)]
pub struct FakeGateway {
    pub calls: Mutex<Vec<String>>,
    pub status: Mutex<VecDeque<GatewayResult<ChannelHealth>>>,
    pub default_status: Mutex<Option<GatewayResult<ChannelHealth>>>,
    pub qr: Mutex<VecDeque<GatewayResult<QrOutcome>>>,
    pub phone: Mutex<VecDeque<GatewayResult<PhoneLoginOutcome>>>,
    pub pages: Mutex<VecDeque<GatewayResult<Vec<GatewayGroup>>>>,
    pub group_meta: Mutex<HashMap<String, VecDeque<GatewayResult<GroupMetadata>>>>,
    pub channels: Mutex<Vec<ChannelSummary>>,
    pub create_ids: Mutex<VecDeque<String>>,
    pub delete_errors: Mutex<VecDeque<GatewayError>>,
    pub logout_error: Mutex<Option<GatewayError>>,
    pub send_errors: Mutex<HashMap<String, GatewayError>>,
    pub created: Mutex<u32>,
    pub on_list: Mutex<Option<OnList>>,
    pub on_status: Mutex<Option<OnStatus>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeGateway::default())
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    pub fn calls_to(&self, method: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.split(' ').next() == Some(method))
            .cloned()
            .collect()
    }

    pub fn script_status(&self, raws: &[&str]) {
        self.status.lock().extend(raws.iter().map(|r| Ok(health(r))));
    }

    pub fn set_default_status(&self, result: GatewayResult<ChannelHealth>) {
        *self.default_status.lock() = Some(result);
    }

    pub fn script_pages(&self, pages: Vec<GatewayResult<Vec<GatewayGroup>>>) {
        self.pages.lock().extend(pages);
    }

    pub fn script_group(&self, group_id: &str, results: Vec<GatewayResult<GroupMetadata>>) {
        self.group_meta.lock().entry(group_id.to_string()).or_default().extend(results);
    }

    pub fn set_on_list(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        *self.on_list.lock() = Some(Box::new(hook));
    }

    /// Runs with the token while a status check is in flight.
    pub fn set_on_status(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_status.lock() = Some(Box::new(hook));
    }
}

#[async_trait]
impl GatewayApi for FakeGateway {
    async fn create_channel(&self, name: &str) -> GatewayResult<ProvisionedChannel> {
        self.record(format!("create_channel {}", name));
        // Yield so concurrent creates interleave inside the controller.
        tokio::task::yield_now().await;
        let n = {
            let mut created = self.created.lock();
            *created += 1;
            *created
        };
        let channel_id = self
            .create_ids
            .lock()
            .pop_front()
            .unwrap_or_else(|| format!("CHANNL-{:05}", n));
        self.channels.lock().push(ChannelSummary { channel_id: channel_id.clone(), name: name.to_string() });
        Ok(ProvisionedChannel { channel_id, token: format!("tok-{}", n), name: name.to_string() })
    }

    async fn delete_channel(&self, channel_id: &str) -> GatewayResult<()> {
        self.record(format!("delete_channel {}", channel_id));
        if let Some(err) = self.delete_errors.lock().pop_front() {
            return Err(err);
        }
        self.channels.lock().retain(|c| c.channel_id != channel_id);
        Ok(())
    }

    async fn list_channels(&self) -> GatewayResult<Vec<ChannelSummary>> {
        self.record("list_channels".into());
        Ok(self.channels.lock().clone())
    }

    async fn set_channel_mode(&self, channel_id: &str, mode: ChannelMode) -> GatewayResult<()> {
        self.record(format!("set_channel_mode {} {}", channel_id, mode));
        Ok(())
    }

    async fn get_status(&self, token: &str) -> GatewayResult<ChannelHealth> {
        self.record(format!("get_status {}", token));
        if let Some(hook) = self.on_status.lock().as_ref() {
            hook(token);
        }
        if let Some(next) = self.status.lock().pop_front() {
            return next;
        }
        self.default_status.lock().clone().unwrap_or_else(|| Ok(health("authenticated")))
    }

    async fn get_qr(&self, token: &str) -> GatewayResult<QrOutcome> {
        self.record(format!("get_qr {}", token));
        self.qr.lock().pop_front().unwrap_or_else(|| Ok(qr_image()))
    }

    async fn login_with_phone(&self, token: &str, phone: &str) -> GatewayResult<PhoneLoginOutcome> {
        self.record(format!("login_with_phone {} {}", token, phone));
        self.phone.lock().pop_front().unwrap_or(Ok(PhoneLoginOutcome::Connected))
    }

    async fn logout(&self, token: &str) -> GatewayResult<()> {
        self.record(format!("logout {}", token));
        match self.logout_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn list_groups(&self, _token: &str, offset: u32, count: u32) -> GatewayResult<Vec<GatewayGroup>> {
        self.record(format!("list_groups {} {}", offset, count));
        if let Some(hook) = self.on_list.lock().as_ref() {
            hook(offset);
        }
        self.pages.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn get_group(&self, _token: &str, group_id: &str) -> GatewayResult<GroupMetadata> {
        self.record(format!("get_group {}", group_id));
        let scripted = self.group_meta.lock().get_mut(group_id).and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| Ok(meta_with_rank(group_id, ParticipantRank::Member)))
    }

    async fn send_message(&self, _token: &str, to: &str, body: &str) -> GatewayResult<SentMessage> {
        self.record(format!("send_message {} {}", to, body));
        match self.send_errors.lock().get(to) {
            Some(err) => Err(err.clone()),
            None => Ok(SentMessage { message_id: format!("msg-{}", to) }),
        }
    }
}

// ── Service harness ────────────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<GroupcastStore>,
    pub gateway: Arc<FakeGateway>,
    pub oracle: Arc<StaticPlanOracle>,
    pub service: GroupcastService,
}

pub fn harness() -> Harness {
    harness_with(EngineConfig::immediate())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    let store = Arc::new(GroupcastStore::open_in_memory().unwrap());
    let gateway = FakeGateway::new();
    let oracle = Arc::new(StaticPlanOracle::new(&config.plan));
    let service = GroupcastService::new(&config, store.clone(), gateway.clone(), oracle.clone());
    Harness { store, gateway, oracle, service }
}

impl Harness {
    /// A stored channel in `status` with a canonical id and token `tok-<user>`.
    pub fn seed_channel(&self, user_id: &str, status: ChannelStatus) -> Channel {
        self.store
            .insert_channel(user_id, "SEEDED-00001", &format!("tok-{}", user_id), false)
            .unwrap();
        if status == ChannelStatus::Created {
            return self.store.require_channel(user_id).unwrap();
        }
        self.store.force_status(user_id, status).unwrap()
    }

    pub fn seed_groups(&self, user_id: &str, from: u32, n: u32) {
        self.store.replace_groups(user_id, &groups(from, n)).unwrap();
    }

    pub fn set_plan(&self, user_id: &str, plan: PlanStatus) {
        self.oracle.set(user_id, plan);
    }

    /// Move the channel's `updated_at` to `ts`.
    pub fn age_channel(&self, user_id: &str, ts: &str) {
        self.store
            .conn
            .lock()
            .execute("UPDATE channels SET updated_at = ?1 WHERE user_id = ?2", rusqlite::params![ts, user_id])
            .unwrap();
    }

    /// Poll until the user's run leaves `starting`/`running`.
    pub async fn wait_for_run(&self, user_id: &str) -> SyncProgress {
        for _ in 0..500 {
            let row = self.service.get_sync_progress(user_id).unwrap();
            if !row.status.is_active() {
                return row;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("run for {} never finished", user_id);
    }
}
