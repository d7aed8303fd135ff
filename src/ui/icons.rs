//! Shared UI icons.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");

pub static ANCHOR: Emoji<'_, '_> = Emoji("⚓ ", "");
pub static SHIP: Emoji<'_, '_> = Emoji("🚢 ", "[>]");
pub static BUILD: Emoji<'_, '_> = Emoji("🔨 ", "[B]");
pub static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[C]");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "");
