/// Live view of the guilds the bot currently serves.
pub trait GuildDirectory: Send + Sync {
    fn guild_name(&self, guild_id: u64) -> Option<String>;
    /// `None` when the guild itself is unknown to the bot.
    fn emote_in_guild(&self, guild_id: u64, emote_id: u64) -> Option<bool>;
    fn emote_owner(&self, emote_id: u64) -> Option<u64>;
}
