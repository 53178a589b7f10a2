// Pretty-print a byte buffer for debug logging: "X" for hex, "C" for ASCII.
#[macro_export]
macro_rules! format_buffer {
    ("X", $buf:expr) => {{
        $buf.iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }};
    ("C", $buf:expr) => {{
        $buf.iter()
            .map(|b| {
                if b.is_ascii_graphic() {
                    *b as char
                } else {
                    '.'
                }
            })
            .collect::<String>()
    }};
}
