use argon2::{
    Argon2, PasswordHasher,
    password_hash::{SaltString, rand_core::OsRng},
};
use majestic_scent_api::{config::AppConfig, db::create_pool};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url).await?;
    // Ensure migrations are applied.
    sqlx::migrate!("./migrations").run(&pool).await?;

    let admin_id = ensure_user(&pool, "Admin", "admin@example.com", "admin123", "admin").await?;
    let client_id = ensure_user(&pool, "Client", "client@example.com", "client123", "client").await?;
    seed_products(&pool).await?;

    println!("Seed completed. Admin ID: {admin_id}, Client ID: {client_id}");
    Ok(())
}

async fn ensure_user(
    pool: &sqlx::PgPool,
    name: &str,
    email: &str,
    password: &str,
    role: &str,
) -> anyhow::Result<Uuid> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .to_string();

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO users (id, name, email, password_hash, role)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (email) DO UPDATE SET role = EXCLUDED.role
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(email)
    .bind(password_hash)
    .bind(role)
    .fetch_optional(pool)
    .await?;

    let user_id = match row {
        Some((id,)) => id,
        None => {
            let existing: (Uuid,) = sqlx::query_as("SELECT id FROM users WHERE email = $1")
                .bind(email)
                .fetch_one(pool)
                .await?;
            existing.0
        }
    };

    println!("Ensured user {email} (role={role})");
    Ok(user_id)
}

async fn seed_products(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let products = vec![
        (
            "Nuit Imperiale",
            "Majestic Scent",
            "Woody amber with smoked cedar",
            "/images/nuit-imperiale.jpg",
            "Homme",
            89_00_i64,
            40,
        ),
        (
            "Aube Doree",
            "Majestic Scent",
            "Orange blossom over white musk",
            "/images/aube-doree.jpg",
            "Femme",
            94_00,
            35,
        ),
        (
            "Sillage Libre",
            "Majestic Scent",
            "Citrus vetiver for any wardrobe",
            "/images/sillage-libre.jpg",
            "Mixte",
            76_00,
            60,
        ),
        (
            "Essence Premiere",
            "Majestic Scent",
            "Concentrated extrait de parfum",
            "/images/essence-premiere.jpg",
            "Parfum",
            129_00,
            15,
        ),
    ];

    for (name, brand, description, image, category, price, stock) in products {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, brand, description, image, category, price, stock)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(brand)
        .bind(description)
        .bind(image)
        .bind(category)
        .bind(price)
        .bind(stock)
        .execute(pool)
        .await?;
    }

    println!("Seeded products");
    Ok(())
}
