// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The in-memory user table consulted at login.

use nanoos_abi::UserId;

/// One account: the stored checksum covers the username and password
/// together, so the cleartext password never lives in kernel memory.
#[derive(Clone, Debug)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub checksum: u32,
}

/// FNV-1a over `username NUL password`; this is what gets stored in the
/// table and recomputed at login.
pub fn login_checksum(username: &str, password: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in username
        .as_bytes()
        .iter()
        .chain(&[0u8])
        .chain(password.as_bytes())
    {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub struct UserTable {
    users: Vec<User>,
}

impl UserTable {
    pub fn new(users: Vec<User>) -> Self {
        Self { users }
    }

    pub fn by_id(&self, user_id: UserId) -> Option<&User> {
        self.users.iter().find(|u| u.user_id == user_id)
    }

    pub fn by_name(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Verifies a login attempt, returning the authenticated user ID.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<UserId> {
        let user = self.by_name(username)?;
        if user.checksum == login_checksum(username, password) {
            Some(user.user_id)
        } else {
            None
        }
    }
}
