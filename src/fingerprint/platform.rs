//! Platform identity used to fill client-hint headers.

/// Operating system / hardware identity of the emulated browser.
///
/// These values feed `Sec-Ch-Ua-Platform`, `-Platform-Version`, `-Arch`,
/// `-Model` and `-Mobile`; they must agree with the `User-Agent` string
/// of the owning preset or client-hint-aware detectors will flag the
/// mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfo {
    /// `Sec-Ch-Ua-Platform` value without quotes ("Windows", "macOS", ...).
    pub platform: &'static str,
    /// `Sec-Ch-Ua-Platform-Version` value without quotes.
    pub platform_version: &'static str,
    /// `Sec-Ch-Ua-Arch` value without quotes.
    pub arch: &'static str,
    /// `Sec-Ch-Ua-Bitness` value without quotes.
    pub bitness: &'static str,
    /// `Sec-Ch-Ua-Model` value without quotes (phones only, else empty).
    pub model: &'static str,
    /// Whether `Sec-Ch-Ua-Mobile` is `?1`.
    pub mobile: bool,
}

impl PlatformInfo {
    pub const WINDOWS: PlatformInfo = PlatformInfo {
        platform: "Windows",
        platform_version: "15.0.0",
        arch: "x86",
        bitness: "64",
        model: "",
        mobile: false,
    };

    pub const MACOS: PlatformInfo = PlatformInfo {
        platform: "macOS",
        platform_version: "15.1.0",
        arch: "arm",
        bitness: "64",
        model: "",
        mobile: false,
    };

    pub const LINUX: PlatformInfo = PlatformInfo {
        platform: "Linux",
        platform_version: "6.8.0",
        arch: "x86",
        bitness: "64",
        model: "",
        mobile: false,
    };

    pub const ANDROID: PlatformInfo = PlatformInfo {
        platform: "Android",
        platform_version: "15.0.0",
        arch: "arm",
        bitness: "64",
        model: "Pixel 9",
        mobile: true,
    };

    pub const IOS: PlatformInfo = PlatformInfo {
        platform: "iOS",
        platform_version: "18.1.0",
        arch: "arm",
        bitness: "64",
        model: "iPhone",
        mobile: true,
    };

    /// `?1` / `?0` form used by `Sec-Ch-Ua-Mobile`.
    pub fn mobile_hint(&self) -> &'static str {
        if self.mobile {
            "?1"
        } else {
            "?0"
        }
    }
}
