//! Well-known cache keys.
//!
//! Every call site derives keys through these builders so the same logical
//! resource always maps to the same entry. There is no hierarchical
//! invalidation: a change to one resource must remove every key that can hold
//! derived data, see [`event_invalidation`].

/// Key for the "all events" list.
pub const EVENTS_ALL: &str = "events_all";

pub fn user_profile(user_id: &str) -> String {
  format!("user_profile_{}", user_id)
}

pub fn event_details(event_id: &str) -> String {
  format!("event_details_{}", event_id)
}

/// Event list key, per user or for everyone.
pub fn events(user_id: Option<&str>) -> String {
  match user_id {
    Some(user_id) => format!("events_{}", user_id),
    None => EVENTS_ALL.to_string(),
  }
}

pub fn friends(user_id: &str) -> String {
  format!("friends_{}", user_id)
}

pub fn comments(event_id: &str) -> String {
  format!("comments_{}", event_id)
}

/// Listener key for a user's incoming friend requests.
pub fn incoming_friend_requests(user_id: &str) -> String {
  format!("friend_requests_in_{}", user_id)
}

/// Every key that may hold stale data once `event_id` changes.
///
/// `owner` is the user whose personal event list includes the event.
pub fn event_invalidation(event_id: &str, owner: Option<&str>) -> Vec<String> {
  let mut keys = vec![event_details(event_id), events(None)];
  if let Some(owner) = owner {
    keys.push(events(Some(owner)));
  }
  keys
}
