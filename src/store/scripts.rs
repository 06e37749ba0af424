/// Lua script for sliding window admission
///
/// Trims, counts, conditionally records and refreshes expiry in one atomic
/// step on the server, so concurrent callers on the same key observe a
/// strictly increasing count.
///
/// KEYS[1] = the window key (sorted set, score = request time in ms)
/// ARGV[1] = current timestamp (ms)
/// ARGV[2] = window duration (ms)
/// ARGV[3] = maximum requests
/// ARGV[4] = unique member for this request
///
/// Returns: [count before this request, recorded (0/1), oldest score or -1]
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max_requests = tonumber(ARGV[3])
local member = ARGV[4]

-- Remove entries strictly older than the window start
local window_start = now - window
redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. window_start)

-- Count requests still inside the window
local current_count = redis.call('ZCARD', key)

local recorded = 0
if current_count < max_requests then
    redis.call('ZADD', key, now, member)
    recorded = 1
end

-- Abandoned keys clean themselves up
redis.call('PEXPIRE', key, window)

local oldest = -1
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if first[2] then
    oldest = tonumber(first[2])
end

return {current_count, recorded, oldest}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_steps_present() {
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZREMRANGEBYSCORE"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZCARD"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZADD"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("PEXPIRE"));
    }

    #[test]
    fn test_trim_is_exclusive_of_window_start() {
        // An entry exactly at the window start is still counted
        assert!(SLIDING_WINDOW_SCRIPT.contains("'(' .. window_start"));
    }
}
