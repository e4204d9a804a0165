//! 通用工具函数

/// 表示托管或受限运行环境的环境变量
pub const RESTRICTED_RUNTIME_VARS: [&str; 4] = ["RAILWAY_ENVIRONMENT", "HEROKU_APP_NAME", "VERCEL", "PORT"];

/// 判断当前是否运行在无法启动浏览器的托管环境中
///
/// `lookup` 通常为 `|k| std::env::var(k).ok()`，测试时可替换。
pub fn detect_restricted_runtime<F>(lookup: F) -> Option<&'static str>
where
    F: Fn(&str) -> Option<String>,
{
    RESTRICTED_RUNTIME_VARS
        .iter()
        .copied()
        .find(|name| lookup(name).map(|v| !v.is_empty()).unwrap_or(false))
}

/// 按 `{key}` 占位符渲染路由模板
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

/// 拼接基础地址与路径
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
