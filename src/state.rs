use std::collections::HashMap;

/// A server-maintained room. Channel 0 is the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub channel_id: u32,
    pub name: String,
    pub description: String,
}

/// A connected user as replicated from `UserState` traffic.
///
/// `session_id` is the per-connection handle assigned by the server;
/// `user_id` is the persistent registered identity, or -1 when unregistered.
/// `local_mute` is client-local and never echoed to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub session_id: u32,
    pub user_id: i32,
    pub channel_id: i32,
    pub name: String,
    pub local_mute: bool,
}

/// Server-wide settings delivered by `ServerConfig`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub max_bandwidth: u32,
    pub allow_html: bool,
    pub message_length: u32,
    pub image_message_length: u32,
    pub welcome_text: String,
}

/// Replicated view of server state plus the self-session fields.
///
/// All mutations originate in the dispatcher or in session lifecycle calls;
/// the session exposes the queries through a single mutex.
#[derive(Debug, Default)]
pub struct ClientState {
    channels: HashMap<u32, Channel>,
    users: HashMap<u32, User>,
    my_session_id: u32,
    current_channel_id: u32,
    server: ServerSnapshot,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every table; run on connect and after disconnect.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.users.clear();
        self.my_session_id = 0;
        self.current_channel_id = 0;
        self.server = ServerSnapshot::default();
    }

    //
    // Channel
    //

    pub fn channel_current(&self) -> u32 {
        self.current_channel_id
    }

    pub fn channel_list(&self) -> Vec<Channel> {
        let mut list: Vec<Channel> = self.channels.values().cloned().collect();
        list.sort_by_key(|channel| channel.channel_id);
        list
    }

    pub fn channel_exists(&self, channel_id: u32) -> bool {
        self.channels.contains_key(&channel_id)
    }

    /// Resolve a channel name to its id, or -1 when unknown.
    pub fn channel_find(&self, name: &str) -> i64 {
        self.channels
            .values()
            .find(|channel| channel.name == name)
            .map(|channel| i64::from(channel.channel_id))
            .unwrap_or(-1)
    }

    /// Insert the channel unless the id is already known.
    pub fn channel_insert_if_absent(&mut self, channel: Channel) {
        self.channels.entry(channel.channel_id).or_insert(channel);
    }

    pub fn channel_erase(&mut self, channel_id: u32) {
        self.channels.remove(&channel_id);
    }

    pub(crate) fn set_current_channel(&mut self, channel_id: u32) {
        self.current_channel_id = channel_id;
    }

    //
    // User
    //

    pub fn user_get(&self, session_id: u32) -> Option<User> {
        self.users.get(&session_id).cloned()
    }

    pub fn user_list(&self) -> Vec<User> {
        let mut list: Vec<User> = self.users.values().cloned().collect();
        list.sort_by_key(|user| user.session_id);
        list
    }

    pub fn users_in_channel(&self, channel_id: i32) -> Vec<User> {
        let mut list: Vec<User> = self
            .users
            .values()
            .filter(|user| user.channel_id == channel_id)
            .cloned()
            .collect();
        list.sort_by_key(|user| user.session_id);
        list
    }

    pub fn user_exists(&self, session_id: u32) -> bool {
        self.users.contains_key(&session_id)
    }

    pub fn user_muted(&self, session_id: u32) -> bool {
        self.users
            .get(&session_id)
            .map(|user| user.local_mute)
            .unwrap_or(false)
    }

    /// Resolve a user name to its session id, or -1 when unknown.
    pub fn user_find(&self, name: &str) -> i64 {
        self.users
            .values()
            .find(|user| user.name == name)
            .map(|user| i64::from(user.session_id))
            .unwrap_or(-1)
    }

    /// Set the local mute flag. Returns false for an unknown session.
    pub fn user_mute(&mut self, session_id: u32, mute: bool) -> bool {
        match self.users.get_mut(&session_id) {
            Some(user) => {
                user.local_mute = mute;
                true
            }
            None => false,
        }
    }

    /// Upsert a user from a `UserState` update.
    ///
    /// The local mute flag always survives. A name is only replaced by a
    /// non-empty one; `user_id` and `channel_id` keep their previous values
    /// when the update omits them.
    pub fn user_update(
        &mut self,
        session_id: u32,
        name: Option<&str>,
        user_id: Option<i32>,
        channel_id: Option<i32>,
    ) {
        let user = self.users.entry(session_id).or_insert(User {
            session_id,
            user_id: -1,
            channel_id: -1,
            name: String::new(),
            local_mute: false,
        });
        if let Some(name) = name {
            if !name.is_empty() {
                user.name = name.to_string();
            }
        }
        if let Some(user_id) = user_id {
            user.user_id = user_id;
        }
        if let Some(channel_id) = channel_id {
            user.channel_id = channel_id;
        }
    }

    pub fn user_erase(&mut self, session_id: u32) {
        self.users.remove(&session_id);
    }

    //
    // Session / server
    //

    pub fn my_session_id(&self) -> u32 {
        self.my_session_id
    }

    pub fn server(&self) -> &ServerSnapshot {
        &self.server
    }

    pub(crate) fn apply_server_sync(&mut self, session_id: u32, welcome_text: &str) {
        self.my_session_id = session_id;
        self.server.welcome_text = welcome_text.to_string();
    }

    pub(crate) fn apply_server_config(&mut self, snapshot: ServerSnapshot) {
        self.server = snapshot;
    }
}
