use reqwest::Client;
use std::time::Duration;

// Проверка online статуса через легковесный HTTP запрос
pub async fn check_online_status() -> bool {
    let client = match Client::builder().timeout(Duration::from_secs(2)).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    match client
        .get("https://www.cloudflare.com/cdn-cgi/trace")
        .timeout(Duration::from_secs(2))
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(_) => {
            match client
                .get("https://www.google.com/generate_204")
                .timeout(Duration::from_secs(2))
                .send()
                .await
            {
                Ok(response) => response.status().is_success() || response.status().as_u16() == 204,
                Err(_) => false,
            }
        }
    }
}
