use btb_core::{
    campaign::Template,
    compose::ComposeMode,
    formatting::truncate_text,
    messaging::types::{InlineButton, InlineKeyboard},
    segment::Segment,
    store::recipients::Recipient,
};

/// Buttons per listing keyboard.
const MAX_LIST_BUTTONS: usize = 10;

pub(crate) fn main_menu() -> InlineKeyboard {
    InlineKeyboard::new(vec![
        vec![
            InlineButton::callback("📊 Statistics", "menu_stats"),
            InlineButton::callback("📢 Broadcast", "menu_broadcast"),
        ],
        vec![
            InlineButton::callback("⏰ Schedule", "menu_schedule"),
            InlineButton::callback("📋 Templates", "menu_templates"),
        ],
        vec![
            InlineButton::callback("👥 Users", "menu_users"),
            InlineButton::callback("📜 History", "menu_history"),
        ],
    ])
}

pub(crate) fn segments(mode: ComposeMode) -> InlineKeyboard {
    let prefix = match mode {
        ComposeMode::Immediate => "segment_",
        ComposeMode::Scheduled => "sched_segment_",
    };
    InlineKeyboard::one_per_row(
        Segment::ALL
            .into_iter()
            .map(|s| InlineButton::callback(s.title(), format!("{prefix}{}", s.label())))
            .collect(),
    )
}

pub(crate) fn analytics() -> InlineKeyboard {
    InlineKeyboard::new(vec![
        vec![
            InlineButton::callback("📊 Detailed", "analytics_detailed"),
            InlineButton::callback("📈 Growth", "analytics_growth"),
        ],
        vec![InlineButton::callback("📥 Export", "analytics_export")],
    ])
}

pub(crate) fn templates(list: &[Template]) -> InlineKeyboard {
    let mut buttons: Vec<InlineButton> = list
        .iter()
        .take(MAX_LIST_BUTTONS)
        .map(|t| {
            InlineButton::callback(
                format!("📤 {}", truncate_text(&t.name, 30)),
                format!("template_use_{}", t.id.0),
            )
        })
        .collect();
    if !list.is_empty() {
        buttons.push(InlineButton::callback("🗑 Delete a template", "template_delete_menu"));
    }
    InlineKeyboard::one_per_row(buttons)
}

pub(crate) fn template_delete(list: &[Template]) -> InlineKeyboard {
    InlineKeyboard::one_per_row(
        list.iter()
            .take(MAX_LIST_BUTTONS)
            .map(|t| {
                InlineButton::callback(
                    format!("🗑 {}", truncate_text(&t.name, 30)),
                    format!("template_delete_{}", t.id.0),
                )
            })
            .collect(),
    )
}

pub(crate) fn user_results(found: &[Recipient]) -> InlineKeyboard {
    InlineKeyboard::one_per_row(
        found
            .iter()
            .take(MAX_LIST_BUTTONS)
            .map(|r| {
                let status = if r.active { "✅" } else { "🚫" };
                InlineButton::callback(
                    format!("{status} {}", truncate_text(&r.display_name(), 30)),
                    format!("user_info_{}", r.id.0),
                )
            })
            .collect(),
    )
}

pub(crate) fn user_card(r: &Recipient) -> InlineKeyboard {
    let label = if r.active { "🚫 Block" } else { "✅ Unblock" };
    InlineKeyboard::one_per_row(vec![InlineButton::callback(
        label,
        format!("user_toggle_{}", r.id.0),
    )])
}

pub(crate) fn history() -> InlineKeyboard {
    InlineKeyboard::one_per_row(vec![InlineButton::callback(
        "📋 Detailed history",
        "history_detailed",
    )])
}

/// Web-app entry button shown to end users on /start.
pub(crate) fn web_app(url: &str) -> InlineKeyboard {
    InlineKeyboard::one_per_row(vec![InlineButton::web_app("🚀 Open app", url)])
}
