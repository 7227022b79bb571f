use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use btb_core::{
    broadcast::BroadcastService,
    compose::ComposeSessions,
    config::Config,
    dispatch::{self, DispatchConfig},
    domain::UserId,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    scheduler::BroadcastScheduler,
    store::Store,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<Store>,
    /// Messenger of the admin bot (operator chats, notifications).
    pub admin: Arc<dyn MessagingPort>,
    /// Messenger of the public bot; also the broadcast transport.
    pub user: Option<Arc<dyn MessagingPort>>,
    pub broadcast: Arc<BroadcastService>,
    pub sessions: Arc<ComposeSessions>,
    pub running: Arc<RunningBroadcasts>,
    /// Fires on shutdown; every in-flight broadcast runs under a child token.
    pub shutdown: CancellationToken,
}

/// Cancel tokens of immediate broadcasts in flight, one per operator.
#[derive(Default)]
pub struct RunningBroadcasts {
    inner: Mutex<RunningInner>,
}

#[derive(Default)]
struct RunningInner {
    next_run: u64,
    by_operator: HashMap<UserId, (u64, CancellationToken)>,
}

/// Handle of one registered broadcast; pass it back to `finish`.
#[derive(Clone, Debug)]
pub struct RunTicket {
    pub operator: UserId,
    pub token: CancellationToken,
    run: u64,
}

impl RunningBroadcasts {
    /// Register a broadcast for `operator`; `None` if one is already running.
    pub async fn begin(&self, operator: UserId, parent: &CancellationToken) -> Option<RunTicket> {
        let mut inner = self.inner.lock().await;
        if inner.by_operator.contains_key(&operator) {
            return None;
        }
        inner.next_run += 1;
        let run = inner.next_run;
        let token = parent.child_token();
        inner.by_operator.insert(operator, (run, token.clone()));
        Some(RunTicket {
            operator,
            token,
            run,
        })
    }

    /// Drop the registration, unless it already belongs to a newer broadcast.
    pub async fn finish(&self, ticket: &RunTicket) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.by_operator.get(&ticket.operator), Some((run, _)) if *run == ticket.run) {
            inner.by_operator.remove(&ticket.operator);
        }
    }

    /// Cancel the operator's running broadcast. Returns whether there was one.
    pub async fn cancel(&self, operator: UserId) -> bool {
        match self.inner.lock().await.by_operator.remove(&operator) {
            Some((_, tok)) => {
                tok.cancel();
                true
            }
            None => false,
        }
    }
}

fn throttled(bot: Bot, cfg: &Config) -> Arc<dyn MessagingPort> {
    // We still keep a 429 RetryAfter retry at the Telegram adapter layer.
    let raw: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot));
    Arc::new(ThrottledMessenger::new(
        raw,
        ThrottleConfig {
            global_min_interval: cfg.global_min_interval,
            per_chat_min_interval: cfg.per_chat_min_interval,
        },
    ))
}

pub async fn run(cfg: Arc<Config>, store: Arc<Store>) -> anyhow::Result<()> {
    let admin_bot = Bot::new(cfg.admin_bot_token.clone());
    let user_bot = cfg.user_bot_token.clone().map(Bot::new);

    // Basic startup info.
    if let Ok(me) = admin_bot.get_me().await {
        tracing::info!("admin bot started: @{}", me.username());
    }
    match &user_bot {
        Some(bot) => {
            if let Ok(me) = bot.get_me().await {
                tracing::info!("user bot started: @{}", me.username());
            }
        }
        None => tracing::warn!("USER_BOT_TOKEN is not set: user bot and broadcasting are disabled"),
    }
    tracing::info!(
        operators = cfg.admin_ids.len(),
        users = store.count(true).unwrap_or_default(),
        "store ready at {}",
        cfg.database_file.display()
    );

    let admin = throttled(admin_bot.clone(), &cfg);
    let transport = user_bot.clone().map(|bot| throttled(bot, &cfg));
    let dispatcher = Arc::new(dispatch::Dispatcher::new(
        transport.clone(),
        DispatchConfig::from(cfg.as_ref()),
    ));
    let broadcast = Arc::new(BroadcastService::new(store.clone(), dispatcher));

    let scheduler = BroadcastScheduler::new(
        broadcast.clone(),
        Some(admin.clone()),
        cfg.scheduler_poll_interval,
    );
    scheduler.start().await;

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        store,
        admin,
        user: transport,
        broadcast,
        sessions: Arc::new(ComposeSessions::new()),
        running: Arc::new(RunningBroadcasts::default()),
        shutdown: CancellationToken::new(),
    });

    let admin_handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_admin_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_admin_message));

    let mut admin_dispatcher = Dispatcher::builder(admin_bot, admin_handler)
        .dependencies(dptree::deps![state.clone()])
        .build();
    let mut shutdown_tokens = vec![admin_dispatcher.shutdown_token()];
    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(async move { admin_dispatcher.dispatch().await });

    if let Some(bot) = user_bot {
        let user_handler = dptree::entry()
            .branch(Update::filter_message().endpoint(handlers::handle_user_message));
        let mut user_dispatcher = Dispatcher::builder(bot, user_handler)
            .dependencies(dptree::deps![state.clone()])
            .build();
        shutdown_tokens.push(user_dispatcher.shutdown_token());
        tasks.spawn(async move { user_dispatcher.dispatch().await });
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("failed to listen for ctrl-c: {e}");
            }
            tracing::info!("shutdown requested");
        }
        _ = tasks.join_next() => {
            tracing::warn!("a bot dispatcher exited");
        }
    }

    state.shutdown.cancel();
    scheduler.stop().await;
    for tok in shutdown_tokens {
        if let Ok(done) = tok.shutdown() {
            done.await;
        }
    }
    while tasks.join_next().await.is_some() {}

    tracing::info!("bye");
    Ok(())
}
