//! In-memory collaborator fakes for unit and integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::admin::{AccountInfo, AdminApi, DeviceInfo};
use crate::error::{AdminError, ChannelError};
use crate::matrix::{EventId, MessagingClient, Notice, RoomId, SessionCredentials, UserId};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Records every outbound call and answers membership queries from a table.
pub struct RecordingMessenger {
    user_id: UserId,
    next_event: AtomicUsize,
    sent: Mutex<Vec<(RoomId, Notice, EventId)>>,
    redactions: Mutex<Vec<(RoomId, EventId)>>,
    joined: Mutex<Vec<RoomId>>,
    left: Mutex<Vec<(RoomId, String)>>,
    read: Mutex<Vec<EventId>>,
    members: Mutex<HashMap<RoomId, Vec<UserId>>>,
    cached: Mutex<HashMap<RoomId, Vec<UserId>>>,
    member_lookups: AtomicUsize,
    fail_redactions: AtomicBool,
    redactions_missing: AtomicBool,
    fail_members: AtomicBool,
    fail_login: AtomicBool,
    logins: Mutex<Vec<UserId>>,
}

impl RecordingMessenger {
    /// `user_id` must be a valid user ID.
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: UserId::parse(user_id).unwrap_or_else(|_| UserId::new("botbot", "localhost")),
            next_event: AtomicUsize::new(1),
            sent: Mutex::new(Vec::new()),
            redactions: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
            left: Mutex::new(Vec::new()),
            read: Mutex::new(Vec::new()),
            members: Mutex::new(HashMap::new()),
            cached: Mutex::new(HashMap::new()),
            member_lookups: AtomicUsize::new(0),
            fail_redactions: AtomicBool::new(false),
            redactions_missing: AtomicBool::new(false),
            fail_members: AtomicBool::new(false),
            fail_login: AtomicBool::new(false),
            logins: Mutex::new(Vec::new()),
        }
    }

    /// Authoritative members returned by `joined_members`.
    pub fn set_members(&self, room_id: &RoomId, members: Vec<UserId>) {
        lock(&self.members).insert(room_id.clone(), members);
    }

    /// Members returned by `cached_members`.
    pub fn set_cached_members(&self, room_id: &RoomId, members: Vec<UserId>) {
        lock(&self.cached).insert(room_id.clone(), members);
    }

    pub fn fail_redactions(&self, fail: bool) {
        self.fail_redactions.store(fail, Ordering::SeqCst);
    }

    /// Answer redactions with `M_NOT_FOUND`, as for an already redacted event.
    pub fn redact_missing(&self, missing: bool) {
        self.redactions_missing.store(missing, Ordering::SeqCst);
    }

    pub fn fail_member_lookups(&self, fail: bool) {
        self.fail_members.store(fail, Ordering::SeqCst);
    }

    pub fn fail_login(&self, fail: bool) {
        self.fail_login.store(fail, Ordering::SeqCst);
    }

    /// Sent notices, oldest first.
    pub fn notices(&self) -> Vec<(RoomId, Notice)> {
        lock(&self.sent)
            .iter()
            .map(|(room, notice, _)| (room.clone(), notice.clone()))
            .collect()
    }

    /// Bodies of sent notices, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        lock(&self.sent)
            .iter()
            .map(|(_, notice, _)| notice.body.clone())
            .collect()
    }

    pub fn last_body(&self) -> Option<String> {
        lock(&self.sent).last().map(|(_, notice, _)| notice.body.clone())
    }

    /// Event ID assigned to the most recent notice.
    pub fn last_event_id(&self) -> Option<EventId> {
        lock(&self.sent).last().map(|(_, _, event)| event.clone())
    }

    pub fn clear_notices(&self) {
        lock(&self.sent).clear();
    }

    pub fn redactions(&self) -> Vec<(RoomId, EventId)> {
        lock(&self.redactions).clone()
    }

    pub fn joined_rooms(&self) -> Vec<RoomId> {
        lock(&self.joined).clone()
    }

    pub fn left_rooms(&self) -> Vec<(RoomId, String)> {
        lock(&self.left).clone()
    }

    pub fn read_receipts(&self) -> Vec<EventId> {
        lock(&self.read).clone()
    }

    pub fn member_lookups(&self) -> usize {
        self.member_lookups.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> Vec<UserId> {
        lock(&self.logins).clone()
    }
}

#[async_trait]
impl MessagingClient for RecordingMessenger {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn send_notice(
        &self,
        room_id: &RoomId,
        notice: Notice,
    ) -> Result<EventId, ChannelError> {
        let n = self.next_event.fetch_add(1, Ordering::SeqCst);
        let event_id = EventId::parse(format!("$notice{}", n))?;
        lock(&self.sent).push((room_id.clone(), notice, event_id.clone()));
        Ok(event_id)
    }

    async fn redact(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        _reason: Option<&str>,
    ) -> Result<(), ChannelError> {
        lock(&self.redactions).push((room_id.clone(), event_id.clone()));
        if self.fail_redactions.load(Ordering::SeqCst) {
            return Err(ChannelError::RequestFailed {
                endpoint: "redact".to_string(),
                reason: "connection reset".to_string(),
            });
        }
        if self.redactions_missing.load(Ordering::SeqCst) {
            return Err(ChannelError::Matrix {
                endpoint: "redact".to_string(),
                status: 404,
                errcode: "M_NOT_FOUND".to_string(),
                message: "Event not found".to_string(),
            });
        }
        Ok(())
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<(), ChannelError> {
        lock(&self.joined).push(room_id.clone());
        Ok(())
    }

    async fn leave_room(&self, room_id: &RoomId, reason: &str) -> Result<(), ChannelError> {
        lock(&self.left).push((room_id.clone(), reason.to_string()));
        Ok(())
    }

    async fn joined_members(&self, room_id: &RoomId) -> Result<Vec<UserId>, ChannelError> {
        self.member_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_members.load(Ordering::SeqCst) {
            return Err(ChannelError::RequestFailed {
                endpoint: "joined_members".to_string(),
                reason: "timeout".to_string(),
            });
        }
        Ok(lock(&self.members).get(room_id).cloned().unwrap_or_default())
    }

    async fn cached_members(&self, room_id: &RoomId) -> Result<Vec<UserId>, ChannelError> {
        Ok(lock(&self.cached).get(room_id).cloned().unwrap_or_default())
    }

    async fn mark_read(&self, _room_id: &RoomId, event_id: &EventId) -> Result<(), ChannelError> {
        lock(&self.read).push(event_id.clone());
        Ok(())
    }

    async fn login(
        &self,
        user_id: &UserId,
        _password: &SecretString,
    ) -> Result<SessionCredentials, ChannelError> {
        if self.fail_login.load(Ordering::SeqCst) {
            return Err(ChannelError::LoginFailed {
                user: user_id.to_string(),
                reason: "M_FORBIDDEN".to_string(),
            });
        }
        let mut logins = lock(&self.logins);
        logins.push(user_id.clone());
        Ok(SessionCredentials {
            user_id: user_id.clone(),
            device_id: format!("DEVICE{}", logins.len()),
            access_token: SecretString::from(format!(
                "syt_{}_{}",
                user_id.localpart(),
                logins.len()
            )),
        })
    }
}

/// Admin step that [`FakeAdmin`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminStep {
    Availability,
    Register,
    Reset,
    AccountInfo,
    Devices,
    Deactivate,
}

/// Admin API backed by in-memory accounts.
#[derive(Default)]
pub struct FakeAdmin {
    accounts: Mutex<HashMap<String, DateTime<Utc>>>,
    passwords: Mutex<HashMap<String, String>>,
    devices: Mutex<HashMap<String, Vec<DeviceInfo>>>,
    deactivated: Mutex<Vec<String>>,
    resets: Mutex<Vec<String>>,
    failing: Mutex<HashSet<AdminStep>>,
}

impl FakeAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a localpart as already taken upstream.
    pub fn add_account(&self, localpart: &str) {
        lock(&self.accounts).insert(localpart.to_string(), Utc::now());
    }

    pub fn set_devices(&self, localpart: &str, devices: Vec<DeviceInfo>) {
        lock(&self.devices).insert(localpart.to_string(), devices);
    }

    pub fn fail(&self, step: AdminStep) {
        lock(&self.failing).insert(step);
    }

    pub fn recover(&self, step: AdminStep) {
        lock(&self.failing).remove(&step);
    }

    pub fn has_account(&self, localpart: &str) -> bool {
        lock(&self.accounts).contains_key(localpart)
    }

    pub fn password_of(&self, localpart: &str) -> Option<String> {
        lock(&self.passwords).get(localpart).cloned()
    }

    pub fn deactivated(&self) -> Vec<String> {
        lock(&self.deactivated).clone()
    }

    pub fn resets(&self) -> Vec<String> {
        lock(&self.resets).clone()
    }

    fn check(&self, step: AdminStep) -> Result<(), AdminError> {
        if lock(&self.failing).contains(&step) {
            return Err(AdminError::Status {
                endpoint: format!("{:?}", step),
                status: 500,
                body: "{\"errcode\":\"M_UNKNOWN\",\"error\":\"Internal server error\"}".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AdminApi for FakeAdmin {
    async fn is_username_available(&self, localpart: &str) -> Result<bool, AdminError> {
        self.check(AdminStep::Availability)?;
        Ok(!lock(&self.accounts).contains_key(localpart))
    }

    async fn register_user(
        &self,
        localpart: &str,
        password: &SecretString,
    ) -> Result<(), AdminError> {
        self.check(AdminStep::Register)?;
        lock(&self.accounts).insert(localpart.to_string(), Utc::now());
        lock(&self.passwords)
            .insert(localpart.to_string(), password.expose_secret().to_string());
        Ok(())
    }

    async fn reset_password(
        &self,
        user_id: &UserId,
        password: &SecretString,
    ) -> Result<(), AdminError> {
        self.check(AdminStep::Reset)?;
        let localpart = user_id.localpart().to_string();
        lock(&self.passwords)
            .insert(localpart.clone(), password.expose_secret().to_string());
        lock(&self.devices).remove(&localpart);
        lock(&self.resets).push(localpart);
        Ok(())
    }

    async fn account_info(&self, user_id: &UserId) -> Result<AccountInfo, AdminError> {
        self.check(AdminStep::AccountInfo)?;
        let created_at = lock(&self.accounts)
            .get(user_id.localpart())
            .copied()
            .ok_or_else(|| AdminError::Status {
                endpoint: "account_info".to_string(),
                status: 404,
                body: "{\"errcode\":\"M_NOT_FOUND\"}".to_string(),
            })?;
        Ok(AccountInfo {
            user_id: user_id.clone(),
            created_at,
            deactivated: lock(&self.deactivated).iter().any(|d| d == user_id.localpart()),
        })
    }

    async fn list_devices(&self, user_id: &UserId) -> Result<Vec<DeviceInfo>, AdminError> {
        self.check(AdminStep::Devices)?;
        Ok(lock(&self.devices)
            .get(user_id.localpart())
            .cloned()
            .unwrap_or_default())
    }

    async fn deactivate_user(&self, user_id: &UserId) -> Result<(), AdminError> {
        self.check(AdminStep::Deactivate)?;
        lock(&self.deactivated).push(user_id.localpart().to_string());
        Ok(())
    }
}
