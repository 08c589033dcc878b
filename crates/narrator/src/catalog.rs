use rand::seq::SliceRandom;
use rand::Rng;

/// Supported narration languages as (code, display name)
pub const LANGUAGES: &[(&str, &str)] = &[
    ("en-us", "American English"),
    ("en-gb", "British English"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("hi", "Hindi"),
    ("it", "Italian"),
    ("ja", "Japanese"),
    ("pt-br", "Brazilian Portuguese"),
    ("zh", "Mandarin Chinese"),
];

/// Voices grouped by (group label, voices)
pub const VOICE_GROUPS: &[(&str, &[&str])] = &[
    ("American English Female", &[
        "af_heart", "af_alloy", "af_aoede", "af_bella", "af_jessica",
        "af_kore", "af_nicole", "af_nova", "af_river", "af_sarah", "af_sky",
    ]),
    ("American English Male", &[
        "am_adam", "am_echo", "am_eric", "am_fenrir", "am_liam",
        "am_michael", "am_onyx", "am_puck", "am_santa",
    ]),
    ("British English Female", &["bf_alice", "bf_emma", "bf_isabella", "bf_lily"]),
    ("British English Male", &["bm_daniel", "bm_fable", "bm_george", "bm_lewis"]),
    ("Japanese", &["jf_alpha", "jf_gongitsune", "jf_nezumi", "jf_tebukuro", "jm_kumo"]),
    ("Mandarin Chinese", &[
        "zf_xiaobei", "zf_xiaoni", "zf_xiaoxiao", "zf_xiaoyi",
        "zm_yunjian", "zm_yunxi", "zm_yunxia", "zm_yunyang",
    ]),
    ("Spanish", &["ef_dora", "em_alex", "em_santa"]),
    ("French", &["ff_siwis"]),
    ("Hindi", &["hf_alpha", "hf_beta", "hm_omega", "hm_psi"]),
    ("Italian", &["if_sara", "im_nicola"]),
    ("Brazilian Portuguese", &["pf_dora", "pm_alex", "pm_santa"]),
];

/// Voice name that defers the choice to job start
pub const RANDOM_VOICE: &str = "random";

pub fn is_supported_language(code: &str) -> bool {
    LANGUAGES.iter().any(|(c, _)| c.eq_ignore_ascii_case(code))
}

pub fn all_voices() -> impl Iterator<Item = &'static str> {
    VOICE_GROUPS.iter().flat_map(|(_, voices)| voices.iter().copied())
}

pub fn is_supported_voice(voice: &str) -> bool {
    voice == RANDOM_VOICE || all_voices().any(|v| v == voice)
}

/// American English voices, the pool `random` draws from
pub fn english_voices() -> impl Iterator<Item = &'static str> {
    VOICE_GROUPS
        .iter()
        .filter(|(group, _)| group.starts_with("American English"))
        .flat_map(|(_, voices)| voices.iter().copied())
}

/// Replace `random` with a concrete English voice
pub fn resolve_voice<R: Rng + ?Sized>(voice: &str, rng: &mut R) -> String {
    if voice != RANDOM_VOICE {
        return voice.to_string();
    }
    let pool: Vec<&str> = english_voices().collect();
    pool.choose(rng).copied().unwrap_or("af_nova").to_string()
}

/// Primary subtag of a language code (`pt-br` -> `pt`)
pub fn primary_language(code: &str) -> String {
    code.split(['-', '_']).next().unwrap_or(code).to_ascii_lowercase()
}
