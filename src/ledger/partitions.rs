/// Key layout for the registry partitions
///
/// - `tasks`: task:{task_id} -> DownloadTask (JSON)
/// - `owners`: owner:{owner_id}\0{task_id} -> empty
///
/// The NUL separator keeps one owner's prefix from matching another owner
/// whose id merely starts with it.

const OWNER_SEPARATOR: char = '\0';

pub fn encode_task_key(task_id: &str) -> Vec<u8> {
    format!("task:{task_id}").into_bytes()
}

pub fn encode_owner_key(owner_id: &str, task_id: &str) -> Vec<u8> {
    format!("owner:{owner_id}{OWNER_SEPARATOR}{task_id}").into_bytes()
}

pub fn encode_owner_prefix(owner_id: &str) -> Vec<u8> {
    format!("owner:{owner_id}{OWNER_SEPARATOR}").into_bytes()
}

/// owner:{owner_id}\0{task_id} -> task_id
pub fn decode_owner_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    let rest = key_str.strip_prefix("owner:")?;
    let (_, task_id) = rest.split_once(OWNER_SEPARATOR)?;
    Some(task_id.to_string())
}
