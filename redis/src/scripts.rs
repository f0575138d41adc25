//! Lua scripts for multi-key seat lock operations.
//!
//! `KEYS` are the seat lock keys; `ARGV[1]` is the owning checkout id and
//! `ARGV[2]` the TTL in milliseconds.

/// Lock every key for the owner, or none if any key exists. Returns 1 or 0.
pub(crate) const ACQUIRE_ALL: &str = r"
for _, key in ipairs(KEYS) do
    if redis.call('EXISTS', key) == 1 then
        return 0
    end
end
for _, key in ipairs(KEYS) do
    redis.call('SET', key, ARGV[1], 'PX', ARGV[2])
end
return 1
";

/// Delete the keys still owned by the owner. Returns the number deleted.
pub(crate) const RELEASE_ALL: &str = r"
local released = 0
for _, key in ipairs(KEYS) do
    if redis.call('GET', key) == ARGV[1] then
        redis.call('DEL', key)
        released = released + 1
    end
end
return released
";

/// If every key is owned by the owner, raise each TTL to at least `ARGV[2]`.
/// Returns 1, or 0 without touching anything.
pub(crate) const EXTEND_ALL: &str = r"
for _, key in ipairs(KEYS) do
    if redis.call('GET', key) ~= ARGV[1] then
        return 0
    end
end
local ttl = tonumber(ARGV[2])
for _, key in ipairs(KEYS) do
    local remaining = redis.call('PTTL', key)
    if remaining >= 0 and remaining < ttl then
        redis.call('PEXPIRE', key, ttl)
    end
end
return 1
";

/// Raise the TTL of `KEYS[1]` to at least `ARGV[1]` milliseconds. Returns 0
/// if the key is gone.
pub(crate) const EXTEND_ONE: &str = r"
local remaining = redis.call('PTTL', KEYS[1])
if remaining == -2 then
    return 0
end
local ttl = tonumber(ARGV[1])
if remaining >= 0 and remaining < ttl then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return 1
";
