 use rand::Rng;

 const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

 pub fn now_ms() -> u64 {
     let now = std::time::SystemTime::now()
         .duration_since(std::time::UNIX_EPOCH)
         .unwrap_or_default();
     now.as_millis() as u64
 }

 pub fn now_iso() -> String {
     chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
 }

 pub fn today_ymd() -> String {
     chrono::Utc::now().format("%Y-%m-%d").to_string()
 }

 /// `req_<unix-millis>_<9 base-36 chars>`
 pub fn request_id(rng: &mut impl Rng) -> String {
     let suffix: String = (0..9)
         .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
         .collect();
     format!("req_{}_{}", now_ms(), suffix)
 }
