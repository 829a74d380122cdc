use owo_colors::Rgb;

/// Log accents: FG1 frames punctuation, FG2 carries values.
pub const FG1: Rgb = Rgb(86, 156, 214);
pub const FG2: Rgb = Rgb(215, 153, 33);
