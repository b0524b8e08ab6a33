//! Redis-backed coordination store.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, AsyncConnectionConfig, Client, Cmd, RedisError, Script, Value};
use tracing::{debug, info};

use super::{
    Command, CoordinationStore, Guard, Reply, SIGNAL_BACKLOG, ScoreBound,
    StoreError, StoreResult, Transaction,
};

/// Redis scripts for atomic operations
mod scripts {
    use redis::Script;

    /// Guarded transaction.
    ///
    /// ARGV layout: guard count, then `kind key a b` per guard, then one
    /// `record argc arg...` group per raw command. Returns nil when a guard
    /// fails, otherwise the recorded replies in order. The pseudo command
    /// `TOLLGATE.CLAMPSIGNAL signal pending` trims a signal list to the
    /// pending set's size.
    pub fn guarded_transaction() -> Script {
        Script::new(
            r#"
            local pos = 1
            local guard_count = tonumber(ARGV[pos])
            pos = pos + 1

            for _ = 1, guard_count do
                local kind, key, a, b = ARGV[pos], ARGV[pos + 1], ARGV[pos + 2], ARGV[pos + 3]
                pos = pos + 4
                if kind == 'field_equals' then
                    if redis.call('HGET', key, a) ~= b then return false end
                elseif kind == 'field_exists' then
                    if redis.call('HEXISTS', key, a) == 0 then return false end
                elseif kind == 'member_exists' then
                    if not redis.call('ZSCORE', key, a) then return false end
                elseif kind == 'score_at_most' then
                    local score = redis.call('ZSCORE', key, a)
                    if not score or tonumber(score) > tonumber(b) then return false end
                else
                    return redis.error_reply('unknown guard ' .. kind)
                end
            end

            local replies = {}
            while pos <= #ARGV do
                local record = ARGV[pos] == '1'
                local argc = tonumber(ARGV[pos + 1])
                local args = {}
                for i = 1, argc do
                    args[i] = ARGV[pos + 1 + i]
                end
                pos = pos + 2 + argc

                local reply
                if args[1] == 'TOLLGATE.CLAMPSIGNAL' then
                    local allowed = redis.call('ZCARD', args[3])
                    if allowed == 0 then
                        redis.call('DEL', args[2])
                    else
                        redis.call('LTRIM', args[2], 0, allowed - 1)
                    end
                    reply = redis.call('LLEN', args[2])
                else
                    reply = redis.call(unpack(args))
                end
                if record then
                    if type(reply) == 'table' and reply['ok'] then
                        reply = reply['ok']
                    end
                    replies[#replies + 1] = reply
                end
            end
            return replies
            "#,
        )
    }
}

/// Idle blocking connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 16;

/// Extra time past a `BLPOP` timeout before the server counts as gone.
const BLOCKING_GRACE: Duration = Duration::from_secs(5);

/// Coordination store backed by a Redis server.
///
/// Normal traffic goes through a shared [`ConnectionManager`]. Each blocking
/// wait checks out a dedicated connection without a client-side response
/// timeout, so a `BLPOP` runs its full length and never stalls other callers.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    guarded: Arc<Script>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .field("idle_blocking", &self.idle_blocking().len())
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        info!("Connecting to coordination store");

        let client = Client::open(redis_url).map_err(|e| {
            StoreError::Command(format!("Failed to create Redis client: {e}"))
        })?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(classify)?;

        let blocking = open_blocking(&client).await?;

        info!("Successfully connected to coordination store");

        Ok(Self {
            client,
            conn,
            blocking: Arc::new(Mutex::new(vec![blocking])),
            guarded: Arc::new(scripts::guarded_transaction()),
        })
    }

    fn idle_blocking(&self) -> MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.blocking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn checkout_blocking(&self) -> StoreResult<MultiplexedConnection> {
        let idle = self.idle_blocking().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => open_blocking(&self.client).await,
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle_blocking();
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }

    async fn execute_pipeline(&self, tx: &Transaction) -> StoreResult<Vec<Reply>> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in tx.commands() {
            for (index, raw) in raw_commands(command).into_iter().enumerate() {
                let cmd = to_cmd(&raw);
                if index == 0 {
                    pipe.add_command(cmd);
                } else {
                    pipe.add_command(cmd).ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        let values: Vec<Value> = pipe.query_async(&mut conn).await.map_err(classify)?;
        values.into_iter().map(to_reply).collect()
    }

    async fn execute_scripted(&self, tx: &Transaction) -> StoreResult<Option<Vec<Reply>>> {
        let mut args: Vec<String> = Vec::new();
        args.push(tx.guards().len().to_string());
        for guard in tx.guards() {
            args.extend(guard_args(guard));
        }
        for command in tx.commands() {
            for (index, raw) in raw_commands(command).into_iter().enumerate() {
                args.push(if index == 0 { "1" } else { "0" }.to_string());
                args.push(raw.len().to_string());
                args.extend(raw);
            }
        }

        let mut invocation = self.guarded.prepare_invoke();
        for arg in &args {
            invocation.arg(arg);
        }

        let mut conn = self.conn.clone();
        let value: Value = invocation.invoke_async(&mut conn).await.map_err(classify)?;
        match value {
            Value::Nil => Ok(None),
            Value::Array(items) => items
                .into_iter()
                .map(to_reply)
                .collect::<StoreResult<Vec<_>>>()
                .map(Some),
            other => Err(StoreError::UnexpectedReply(format!(
                "guarded transaction returned {other:?}"
            ))),
        }
    }
}

/// Connection for `BLPOP`. The default response timeout would cut long waits short.
async fn open_blocking(client: &Client) -> StoreResult<MultiplexedConnection> {
    let config = AsyncConnectionConfig::new().set_response_timeout(None);
    client
        .get_multiplexed_async_connection_with_config(&config)
        .await
        .map_err(classify)
}

/// Map a Redis error onto the store taxonomy.
fn classify(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

/// Script-only command name for [`Command::ClampSignal`].
const CLAMP_SIGNAL: &str = "TOLLGATE.CLAMPSIGNAL";

/// Transactions that must run through the Lua script.
fn needs_script(tx: &Transaction) -> bool {
    tx.is_guarded()
        || tx
            .commands()
            .iter()
            .any(|command| matches!(command, Command::ClampSignal { .. }))
}

fn millis(duration: &Duration) -> String {
    duration.as_millis().max(1).to_string()
}

/// Raw Redis invocations for one command. Only the first reply is reported.
fn raw_commands(command: &Command) -> Vec<Vec<String>> {
    let s = |v: &str| v.to_string();
    match command {
        Command::Get { key } => vec![vec![s("GET"), key.clone()]],
        Command::Set { key, value, ttl } => {
            let mut raw = vec![s("SET"), key.clone(), value.clone()];
            if let Some(ttl) = ttl {
                raw.push(s("PX"));
                raw.push(millis(ttl));
            }
            vec![raw]
        }
        Command::Delete { key } => vec![vec![s("DEL"), key.clone()]],
        Command::Expire { key, ttl } => vec![vec![s("PEXPIRE"), key.clone(), millis(ttl)]],
        Command::ZAdd { key, member, score } => {
            vec![vec![s("ZADD"), key.clone(), score.to_string(), member.clone()]]
        }
        Command::ZRem { key, member } => vec![vec![s("ZREM"), key.clone(), member.clone()]],
        Command::ZRemRangeByScore { key, min, max } => vec![vec![
            s("ZREMRANGEBYSCORE"),
            key.clone(),
            min.as_arg(),
            max.as_arg(),
        ]],
        Command::ZCard { key } => vec![vec![s("ZCARD"), key.clone()]],
        Command::HSet { key, field, value } => {
            vec![vec![s("HSET"), key.clone(), field.clone(), value.clone()]]
        }
        Command::HGet { key, field } => vec![vec![s("HGET"), key.clone(), field.clone()]],
        Command::HDel { key, field } => vec![vec![s("HDEL"), key.clone(), field.clone()]],
        Command::HLen { key } => vec![vec![s("HLEN"), key.clone()]],
        Command::ClampSignal { key, pending } => {
            vec![vec![s(CLAMP_SIGNAL), key.clone(), pending.clone()]]
        }
        Command::Notify { key } => vec![
            vec![s("RPUSH"), key.clone(), s("1")],
            vec![
                s("LTRIM"),
                key.clone(),
                format!("-{SIGNAL_BACKLOG}"),
                s("-1"),
            ],
        ],
    }
}

fn guard_args(guard: &Guard) -> [String; 4] {
    match guard {
        Guard::FieldEquals { key, field, value } => [
            "field_equals".into(),
            key.clone(),
            field.clone(),
            value.clone(),
        ],
        Guard::FieldExists { key, field } => {
            ["field_exists".into(), key.clone(), field.clone(), String::new()]
        }
        Guard::MemberExists { key, member } => {
            ["member_exists".into(), key.clone(), member.clone(), String::new()]
        }
        Guard::ScoreAtMost { key, member, max } => [
            "score_at_most".into(),
            key.clone(),
            member.clone(),
            max.to_string(),
        ],
    }
}

fn to_cmd(raw: &[String]) -> Cmd {
    let mut cmd = redis::cmd(&raw[0]);
    for arg in &raw[1..] {
        cmd.arg(arg);
    }
    cmd
}

fn to_reply(value: Value) -> StoreResult<Reply> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Okay => Ok(Reply::Ok),
        Value::Int(n) => Ok(Reply::Int(n)),
        Value::BulkString(bytes) => String::from_utf8(bytes)
            .map(Reply::Text)
            .map_err(|e| StoreError::UnexpectedReply(format!("non-utf8 reply: {e}"))),
        Value::SimpleString(text) if text == "OK" => Ok(Reply::Ok),
        Value::SimpleString(text) => Ok(Reply::Text(text)),
        other => Err(StoreError::UnexpectedReply(format!("{other:?}"))),
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn execute(&self, tx: Transaction) -> StoreResult<Option<Vec<Reply>>> {
        if tx.is_empty() && !tx.is_guarded() {
            return Ok(Some(Vec::new()));
        }
        if needs_script(&tx) {
            self.execute_scripted(&tx).await
        } else {
            self.execute_pipeline(&tx).await.map(Some)
        }
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        debug!("Store KEYS: {}", pattern);
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await.map_err(classify)?;
        Ok(keys)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(min.as_arg()).arg(max.as_arg()).arg("WITHSCORES");
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(classify)
    }

    async fn zrevrange_by_score(
        &self,
        key: &str,
        max: ScoreBound,
        min: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        let mut cmd = redis::cmd("ZREVRANGEBYSCORE");
        cmd.arg(key).arg(max.as_arg()).arg(min.as_arg()).arg("WITHSCORES");
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(classify)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify)
    }

    async fn wait_for_signal(&self, key: &str, timeout: Duration) -> StoreResult<bool> {
        let mut conn = self.checkout_blocking().await?;

        // BLPOP treats 0 as "forever"; keep the wait bounded.
        let seconds = timeout.as_secs_f64().max(0.01);
        let mut cmd = redis::cmd("BLPOP");
        cmd.arg(key).arg(seconds);
        let popped = tokio::time::timeout(
            timeout + BLOCKING_GRACE,
            cmd.query_async::<Option<(String, String)>>(&mut conn),
        )
        .await;

        // Connections that errored or never answered are dropped, not reused.
        match popped {
            Ok(Ok(token)) => {
                self.checkin_blocking(conn);
                Ok(token.is_some())
            }
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(StoreError::Unavailable(format!(
                "no reply to BLPOP on '{key}' within {:?}",
                timeout + BLOCKING_GRACE
            ))),
        }
    }
}
