//! MIME type ⇄ uniform type identifier mapping used in `/Ask` file descriptors

pub const FALLBACK_MIME: &str = "*/*";
pub const FALLBACK_UTI: &str = "public.content";

/// Fixed bidirectional table. Wildcard MIME types collapse every subtype onto one UTI.
pub const TABLE: &[(&str, &str)] = &[
    ("image/jpeg", "public.jpeg"),
    ("image/jp2", "public.jpeg-2000"),
    ("image/gif", "com.compuserve.gif"),
    ("image/png", "public.png"),
    ("image/*", "public.image"),
    ("audio/*", "public.audio"),
    ("video/*", "public.video"),
];

/// Type tag advertised for an entity. Image subtypes are decided by the file extension.
pub fn uti_for(mime: &str, name: &str) -> &'static str {
    if mime.starts_with("image/") {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".jpg") || name.ends_with(".jpeg") {
            "public.jpeg"
        } else if name.ends_with(".jp2") {
            "public.jpeg-2000"
        } else if name.ends_with(".gif") {
            "com.compuserve.gif"
        } else if name.ends_with(".png") {
            "public.png"
        } else {
            "public.image"
        }
    } else if mime.starts_with("audio/") {
        "public.audio"
    } else if mime.starts_with("video/") {
        "public.video"
    } else {
        FALLBACK_UTI
    }
}

pub fn mime_for_uti(uti: &str) -> &'static str {
    TABLE
        .iter()
        .find(|(_, u)| *u == uti)
        .map(|(m, _)| *m)
        .unwrap_or(FALLBACK_MIME)
}

/// Best-effort MIME type from a file name, for entities built from paths.
pub fn mime_for_name(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "jp2" => "image/jp2",
        "gif" => "image/gif",
        "png" => "image/png",
        "heic" => "image/heic",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_name(mime: &str) -> &'static str {
        match mime {
            "image/jpeg" => "a.jpg",
            "image/jp2" => "a.jp2",
            "image/gif" => "a.gif",
            "image/png" => "a.png",
            _ => "a.bin",
        }
    }

    #[test]
    fn table_round_trips() {
        for (mime, uti) in TABLE {
            assert_eq!(uti_for(mime, sample_name(mime)), *uti, "{mime}");
            assert_eq!(mime_for_uti(uti), *mime, "{uti}");
        }
    }

    #[test]
    fn wildcards_collapse() {
        assert_eq!(uti_for("audio/mpeg", "song.mp3"), "public.audio");
        assert_eq!(mime_for_uti("public.audio"), "audio/*");
        assert_eq!(uti_for("video/mp4", "clip.mp4"), "public.video");
        assert_eq!(uti_for("image/heic", "x.heic"), "public.image");
        assert_eq!(uti_for("image/png", "SHOT.PNG"), "public.png");
    }

    #[test]
    fn fallback_both_ways() {
        assert_eq!(uti_for("application/pdf", "doc.pdf"), FALLBACK_UTI);
        assert_eq!(uti_for("", "x"), FALLBACK_UTI);
        assert_eq!(mime_for_uti(FALLBACK_UTI), FALLBACK_MIME);
        assert_eq!(mime_for_uti("com.example.unknown"), FALLBACK_MIME);
        assert_eq!(mime_for_uti("public/audio"), FALLBACK_MIME);
    }

    #[test]
    fn mime_from_names() {
        assert_eq!(mime_for_name("IMG_0001.JPG"), "image/jpeg");
        assert_eq!(mime_for_name("notes"), "application/octet-stream");
        assert_eq!(mime_for_name("movie.mov"), "video/quicktime");
    }
}
