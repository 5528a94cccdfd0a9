/// Lua script for the fixed-window counter
///
/// Increments the counter and sets its expiry in one atomic step, so a key is
/// never left without a TTL and a competing first request can never reset a
/// window that is already running.
///
/// KEYS[1] = the counter key
/// ARGV[1] = window duration (seconds)
///
/// Returns: the count after this increment
pub const INCREMENT_WITH_EXPIRY_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])

local current = redis.call('INCR', key)

if current == 1 then
    redis.call('EXPIRE', key, window)
elseif redis.call('TTL', key) == -1 then
    -- Key survived without an expiry; bound it now
    redis.call('EXPIRE', key, window)
end

return current
"#;

/// Lua script for the hourly slow-path aggregate
///
/// KEYS[1] = the aggregate hash key
/// ARGV[1] = duration of this sample (milliseconds)
/// ARGV[2] = 1 if the sample counts as slow, else 0
/// ARGV[3] = aggregate TTL (seconds)
///
/// Returns: the sample count after this update
pub const HOURLY_AGGREGATE_SCRIPT: &str = r#"
local key = KEYS[1]
local duration = tonumber(ARGV[1])
local slow = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local count = redis.call('HINCRBY', key, 'count', 1)
redis.call('HINCRBY', key, 'total_duration_ms', duration)
redis.call('HINCRBY', key, 'slow_operation_count', slow)

if redis.call('TTL', key) == -1 then
    redis.call('EXPIRE', key, ttl)
end

return count
"#;
