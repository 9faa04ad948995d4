diesel::table! {
    emote_usages (guild_id, user_id, sent_at, emote_id) {
        guild_id -> BigInt,
        user_id -> BigInt,
        emote_id -> Text,
        sent_at -> BigInt,
        usages -> Integer,
    }
}

diesel::table! {
    custom_emote_metadata (id) {
        id -> BigInt,
        name -> Text,
        animated -> Bool,
        guild_id -> Nullable<BigInt>,
    }
}

diesel::table! {
    guilds (id) {
        id -> BigInt,
    }
}

diesel::table! {
    channels (channel_id) {
        channel_id -> BigInt,
        guild_id -> BigInt,
        latest_parsed_id -> Nullable<BigInt>,
        earliest_parsed_id -> Nullable<BigInt>,
        latest_unparsed_id -> Nullable<BigInt>,
        catch_up_newest_id -> Nullable<BigInt>,
        phase -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(emote_usages, custom_emote_metadata, guilds, channels,);
